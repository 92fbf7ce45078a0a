/// Unit-norm face embedding.
///
/// Construction normalizes the vector, so cosine similarity between two
/// embeddings reduces to a dot product.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// L2-normalizes `values`. Returns `None` for empty, zero-norm or
    /// non-finite input.
    pub fn normalized(mut values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if !l2_normalize(&mut values) {
            return None;
        }
        Some(Self(values))
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity; vectors of different dimension never match.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (*a as f64) * (*b as f64))
            .sum::<f64>() as f32
    }
}

/// Normalizes in place; returns `false` (leaving `v` untouched) for a zero vector.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_normalize_unit_vector() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert_relative_eq!(v[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(v[1], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        assert!(!l2_normalize(&mut v));
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_normalized_rejects_degenerate_input() {
        assert!(Embedding::normalized(vec![]).is_none());
        assert!(Embedding::normalized(vec![0.0; 4]).is_none());
        assert!(Embedding::normalized(vec![1.0, f32::NAN]).is_none());
    }

    #[test]
    fn test_self_similarity_is_one() {
        let e = Embedding::normalized((1..=512).map(|i| (i as f32).sin()).collect()).unwrap();
        assert_eq!(e.dimension(), 512);
        assert_relative_eq!(e.similarity(&e), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_orthogonal_similarity_is_zero() {
        let a = Embedding::normalized(vec![1.0, 0.0]).unwrap();
        let b = Embedding::normalized(vec![0.0, 2.0]).unwrap();
        assert_relative_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let a = Embedding::normalized(vec![1.0, 0.0]).unwrap();
        let b = Embedding::normalized(vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(a.similarity(&b), 0.0);
    }
}
