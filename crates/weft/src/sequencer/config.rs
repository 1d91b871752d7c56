//! Sequencer configuration

use crate::error::Error;
use rustc_hash::FxBuildHasher;
use std::fmt;
use std::sync::Arc;

/// Default initial capacity of the key map
pub const DEFAULT_BUCKET_COUNT: usize = 100;

/// Called with the error of every sequenced task that fails
pub type ExceptionCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Options for [`Sequencer`](crate::Sequencer)
#[derive(Clone)]
pub struct SequencerConfiguration<S = FxBuildHasher> {
    /// Initial capacity of the key map
    pub bucket_count: usize,
    /// Hasher used for sequence keys
    pub hasher: S,
    /// Invoked when a sequenced task fails; successors still run
    pub exception_callback: Option<ExceptionCallback>,
}

impl Default for SequencerConfiguration<FxBuildHasher> {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            hasher: FxBuildHasher,
            exception_callback: None,
        }
    }
}

impl SequencerConfiguration<FxBuildHasher> {
    /// Default configuration using `FxBuildHasher`
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> SequencerConfiguration<S> {
    /// Set the initial key map capacity
    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Install a failure callback
    pub fn with_exception_callback(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.exception_callback = Some(Arc::new(callback));
        self
    }

    /// Switch to another key hasher
    pub fn with_hasher<H>(self, hasher: H) -> SequencerConfiguration<H> {
        SequencerConfiguration {
            bucket_count: self.bucket_count,
            hasher,
            exception_callback: self.exception_callback,
        }
    }
}

impl<S> fmt::Debug for SequencerConfiguration<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerConfiguration")
            .field("bucket_count", &self.bucket_count)
            .field("exception_callback", &self.exception_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;

    #[test]
    fn test_builder() {
        let config = SequencerConfiguration::new()
            .with_bucket_count(8)
            .with_exception_callback(|_| {})
            .with_hasher(RandomState::new());
        assert_eq!(config.bucket_count, 8);
        assert!(config.exception_callback.is_some());
    }
}
