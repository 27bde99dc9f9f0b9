//! Embedding provider traits. Wax never ships a concrete network-backed provider; callers
//! implement `EmbeddingProvider` against whatever on-device model they run and hand it to the
//! orchestrator.

use crate::errors::WaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    OnDevice,
    Remote,
}

pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;
    fn execution_mode(&self) -> ExecutionMode;
    fn embed(&self, text: &str) -> Result<Vec<f32>, WaxError>;

    /// Whether embeddings this provider returns should be L2-normalized before storage.
    /// Most on-device models already emit unit vectors; override when they don't.
    fn normalize(&self) -> bool {
        false
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Providers that can batch more efficiently than one-at-a-time `embed` calls fall back to the
/// default per-item loop when they don't override this.
pub trait BatchEmbeddingProvider: EmbeddingProvider {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, WaxError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

impl<T: EmbeddingProvider + ?Sized> BatchEmbeddingProvider for T {}

/// A deterministic no-op provider for tests: hashes text into a fixed-dimension vector so
/// repeated calls with the same text produce the same embedding without any real model.
#[cfg(test)]
pub struct NullEmbeddingProvider {
    dims: usize,
}

#[cfg(test)]
impl NullEmbeddingProvider {
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[cfg(test)]
impl EmbeddingProvider for NullEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::OnDevice
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, WaxError> {
        let digest = crate::checksum::digest(text.as_bytes());
        Ok((0..self.dims).map(|i| f32::from(digest[i % digest.len()]) / 255.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_provider_is_deterministic() {
        let provider = NullEmbeddingProvider::new(8);
        assert_eq!(provider.embed("same text").unwrap(), provider.embed("same text").unwrap());
    }

    #[test]
    fn batch_default_matches_per_item_calls() {
        let provider = NullEmbeddingProvider::new(4);
        let texts = vec!["a".to_string(), "b".to_string()];
        let batch = provider.embed_batch(&texts).unwrap();
        assert_eq!(batch[0], provider.embed("a").unwrap());
        assert_eq!(batch[1], provider.embed("b").unwrap());
    }
}
