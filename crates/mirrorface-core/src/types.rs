/// Cosine similarity at or above which two ArcFace embeddings are the same person.
pub const MATCH_THRESHOLD: f32 = 0.40;

/// Label written when a detected face does not match the enrolled identity.
pub const UNKNOWN_LABEL: &str = "<Unknown Person>";

/// Identity label used when no `*-id.png` file names the enrolled person.
pub const DEFAULT_IDENTITY_LABEL: &str = "Guest";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Whether `self` and `other` belong to the same face under `MATCH_THRESHOLD`.
    pub fn matches(&self, other: &Embedding) -> bool {
        self.values.len() == other.values.len() && self.similarity(other) >= MATCH_THRESHOLD
    }
}

/// The single reference face, built once at startup and never modified.
///
/// Its display label is owned by the recognition loop, which may refresh it
/// from `*-id.png` files while the embedding stays fixed.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    embedding: Embedding,
}

impl EnrolledIdentity {
    pub fn new(embedding: Embedding) -> Self {
        Self { embedding }
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_matches_uses_threshold() {
        let reference = emb(vec![1.0, 0.0]);
        // cos = 0.6 -> match
        assert!(reference.matches(&emb(vec![0.6, 0.8])));
        // cos = 0.28 -> no match
        assert!(!reference.matches(&emb(vec![0.28, 0.96])));
    }

    #[test]
    fn test_matches_rejects_dimension_mismatch() {
        let reference = emb(vec![1.0, 0.0, 0.0]);
        assert!(!reference.matches(&emb(vec![1.0, 0.0])));
    }

    #[test]
    fn test_enrolled_identity_accessors() {
        let identity = EnrolledIdentity::new(emb(vec![0.5, 0.5]));
        assert_eq!(identity.embedding().values, vec![0.5, 0.5]);
    }
}
