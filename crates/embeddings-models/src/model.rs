//! Embedding vector type and vector helpers.

/// Vector embedding - a normalized float array.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector (normalized to unit length)
    pub values: Vec<f32>,
}

impl Embedding {
    /// Create a new embedding from a vector.
    /// Normalizes the vector to unit length; a zero vector is kept as is.
    pub fn new(mut values: Vec<f32>) -> Self {
        normalize_in_place(&mut values);
        Self { values }
    }

    /// Get the embedding dimension
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector
    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Leading components, at most `n`.
    pub fn sample(&self, n: usize) -> Vec<f32> {
        self.values.iter().take(n).copied().collect()
    }
}

/// Euclidean norm.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale to unit length unless the norm is exactly zero.
pub fn normalize_in_place(values: &mut [f32]) {
    let norm = l2_norm(values);
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_normalization() {
        let emb = Embedding::new(vec![3.0, 4.0]);
        // 3-4-5 triangle: normalized should be [0.6, 0.8]
        assert!((emb.values[0] - 0.6).abs() < 0.001);
        assert!((emb.values[1] - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_zero_vector_is_left_alone() {
        let emb = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(emb.values, vec![0.0, 0.0, 0.0]);
        assert_eq!(emb.norm(), 0.0);
    }

    #[test]
    fn test_normalize_in_place_unit_length() {
        let mut values = vec![1.0, 2.0, 2.0];
        normalize_in_place(&mut values);
        assert!((l2_norm(&values) - 1.0).abs() < 1e-6);
        assert!((values[0] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_truncates() {
        let emb = Embedding::new((1..=12).map(|i| i as f32).collect());
        assert_eq!(emb.sample(8), emb.values[..8].to_vec());
        assert_eq!(Embedding::new(vec![2.0]).sample(8), vec![1.0]);
    }
}
