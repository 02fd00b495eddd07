//! Descriptor matching — rank a probe against the enrolled gallery.

use crate::descriptor::FaceDescriptor;
use crate::extract::{ExtractError, FeatureExtractor};

/// One enrolled descriptor offered to the matcher.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student_id: String,
    pub descriptor: FaceDescriptor,
}

/// One ranked candidate for a query face. Transient, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub student_id: String,
    pub score: f32,
}

/// Outcome of matching one face against the gallery.
///
/// A below-threshold best score is a normal, representable result, not an
/// error: callers must be able to tell "nothing enrolled" and "face found
/// but no confident match" apart from a confident match.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Candidates scoring at or above the threshold, best first.
    Matched(Vec<MatchCandidate>),
    /// The gallery was searched but the best score fell below the threshold.
    NoConfidentMatch { best: Option<MatchCandidate> },
    /// No descriptors are enrolled at all.
    EmptyGallery,
}

impl MatchOutcome {
    /// The top confident candidate, if any.
    pub fn top(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Matched(candidates) => candidates.first(),
            _ => None,
        }
    }
}

/// Strategy for ranking a probe descriptor against the gallery.
pub trait Matcher {
    fn rank(
        &self,
        probe: &FaceDescriptor,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> MatchOutcome;
}

/// Similarity matcher over pixel-statistic descriptors.
///
/// Scores every gallery entry, orders descending by score with ties broken
/// by ascending student id so results are deterministic.
pub struct DescriptorMatcher;

impl Matcher for DescriptorMatcher {
    fn rank(
        &self,
        probe: &FaceDescriptor,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> MatchOutcome {
        if gallery.is_empty() {
            return MatchOutcome::EmptyGallery;
        }

        let mut candidates: Vec<MatchCandidate> = gallery
            .iter()
            .map(|entry| MatchCandidate {
                student_id: entry.student_id.clone(),
                score: probe.similarity(&entry.descriptor),
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });

        let confident: Vec<MatchCandidate> = candidates
            .iter()
            .filter(|c| c.score >= threshold)
            .cloned()
            .collect();

        if confident.is_empty() {
            MatchOutcome::NoConfidentMatch {
                best: candidates.into_iter().next(),
            }
        } else {
            MatchOutcome::Matched(confident)
        }
    }
}

impl DescriptorMatcher {
    /// Group-photo path: run the single-face pipeline independently over
    /// pre-cropped face regions (region detection is an external concern).
    ///
    /// Each region gets its own outcome; a region that fails to decode
    /// yields a per-region error rather than failing the batch.
    pub fn rank_regions(
        &self,
        regions: &[Vec<u8>],
        extractor: &FeatureExtractor,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Vec<Result<MatchOutcome, ExtractError>> {
        regions
            .iter()
            .map(|bytes| {
                extractor
                    .extract(bytes)
                    .map(|probe| self.rank(&probe, gallery, threshold))
            })
            .collect()
    }
}
