//! rollcall-core — Face descriptor extraction and similarity matching.
//!
//! Descriptors are cheap, deterministic pixel statistics (channel means and
//! spreads over a fixed normalization grid), not learned embeddings. Their
//! accuracy bound is a documented limitation of the approach.

pub mod descriptor;
pub mod extract;
pub mod matcher;

pub use descriptor::FaceDescriptor;
pub use extract::{ExtractError, FeatureExtractor};
pub use matcher::{DescriptorMatcher, MatchCandidate, MatchOutcome, Matcher};

/// Default side length of the normalized pixel grid.
pub const DEFAULT_NORMALIZE_SIZE: u32 = 100;

/// Default similarity threshold for a confident match.
pub const DEFAULT_THRESHOLD: f32 = 0.5;
