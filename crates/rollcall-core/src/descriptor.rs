use serde::{Deserialize, Serialize};

/// Fixed-length pixel-statistic descriptor for one face-bearing image.
///
/// All values are normalized into `[0, 1]`. Every descriptor produced with
/// the same normalization size has the same length, so stored descriptors
/// stay comparable across the whole database.
///
/// Serializes transparently as a flat array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDescriptor {
    pub values: Vec<f32>,
}

impl FaceDescriptor {
    /// Similarity between two descriptors, mapped into `[0, 1]`.
    ///
    /// Computed as `1 − mean(|aᵢ − bᵢ|)`: identical descriptors score
    /// exactly 1.0 and the score decreases monotonically with descriptor
    /// distance. Descriptors of different lengths score 0.0.
    pub fn similarity(&self, other: &FaceDescriptor) -> f32 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return 0.0;
        }

        let total_diff: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        let mean_diff = total_diff / self.values.len() as f32;

        (1.0 - mean_diff).clamp(0.0, 1.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
