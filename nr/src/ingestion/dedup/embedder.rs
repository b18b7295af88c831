//! Embedding backends for semantic deduplication

use sha1::{Digest, Sha1};
use thiserror::Error;

/// External model families require an out-of-process runtime; the hashing
/// fallback must be opted into so quality degradation is never silent.
const EXTERNAL_MODEL_PREFIX: &str = "intfloat/multilingual-e5";

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error(
        "embedding model {model_name} requires an external model runtime; \
         enable dedup model fallback to use the hashing embedder"
    )]
    ExternalModelUnavailable { model_name: String },
}

/// Embedding backend interface; vectors are L2-normalized.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// CPU-friendly fallback embedder based on hashed character n-grams.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model_name: String,
    dimensions: usize,
    ngram_size: usize,
}

impl HashingEmbedder {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            dimensions: 384,
            ngram_size: 3,
        }
    }

    fn embed_single(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return vector;
        }

        let mut chars: Vec<char> = normalized.chars().collect();
        while chars.len() < self.ngram_size {
            chars.push(' ');
        }

        for window in chars.windows(self.ngram_size) {
            let ngram: String = window.iter().collect();
            let mut hasher = Sha1::new();
            hasher.update(ngram.as_bytes());
            let digest = hasher.finalize();
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
                as usize
                % self.dimensions;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed_single(text)).collect()
    }
}

/// Build the configured embedder.
pub fn build_embedder(
    model_name: &str,
    allow_fallback: bool,
) -> Result<Box<dyn Embedder>, EmbedderError> {
    if model_name.starts_with(EXTERNAL_MODEL_PREFIX) && !allow_fallback {
        return Err(EmbedderError::ExternalModelUnavailable {
            model_name: model_name.to_string(),
        });
    }
    Ok(Box::new(HashingEmbedder::new(model_name)))
}

/// Cosine similarity for normalized vectors, clamped to [-1, 1].
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    debug_assert_eq!(left.len(), right.len());
    let dot: f32 = left
        .iter()
        .zip(right.iter())
        .map(|(l_value, r_value)| l_value * r_value)
        .sum();
    dot.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new("hash-test");
        let vectors = embedder.embed(&["hello world".to_string(), "hello world".to_string()]);
        assert_eq!(vectors[0], vectors[1]);

        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new("hash-test");
        let vectors = embedder.embed(&["   ".to_string()]);
        assert!(vectors[0].iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_short_text_is_padded() {
        let embedder = HashingEmbedder::new("hash-test");
        let vectors = embedder.embed(&["ab".to_string()]);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = HashingEmbedder::new("hash-test");
        let vectors = embedder.embed(&[
            "breaking news about the election".to_string(),
            "breaking news about the election results".to_string(),
            "completely unrelated cooking recipe".to_string(),
        ]);
        let close = cosine_similarity(&vectors[0], &vectors[1]);
        let far = cosine_similarity(&vectors[0], &vectors[2]);
        assert!(close > far);
    }

    #[test]
    fn test_cosine_self_similarity_is_one() {
        let embedder = HashingEmbedder::new("hash-test");
        let vectors = embedder.embed(&["some text".to_string()]);
        assert!((cosine_similarity(&vectors[0], &vectors[0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_external_model_requires_fallback_opt_in() {
        let error = build_embedder("intfloat/multilingual-e5-small", false).err();
        assert!(error.is_some());

        let embedder = build_embedder("intfloat/multilingual-e5-small", true).unwrap();
        assert_eq!(embedder.model_name(), "intfloat/multilingual-e5-small");
    }
}
