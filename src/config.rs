use fieldx::fxstruct;

/// Scalar loader settings.
///
/// ```ignore
/// let config = LoaderConfig::builder()
///     .name("users")
///     .max_batch_size(100)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[fxstruct(builder, get)]
pub struct LoaderConfig {
    /// Loader name. Most useful for debugging and logging.
    #[fieldx(builder(into), default(String::from("<anon>")))]
    name: String,

    /// The largest number of keys sent to the batch function at once. Once a batch is this big it is sealed and the
    /// next load opens a new one. Values below 1 are treated as 1.
    #[fieldx(default(usize::MAX))]
    max_batch_size: usize,
}

impl LoaderConfig {
    #[inline]
    pub(crate) fn batch_limit(&self) -> usize {
        (*self.max_batch_size()).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::new();
        assert_eq!(config.name(), "<anon>");
        assert_eq!(config.batch_limit(), usize::MAX);
    }

    #[test]
    fn builder() {
        let config = LoaderConfig::builder()
            .name("users")
            .max_batch_size(0)
            .build()
            .unwrap();
        assert_eq!(config.name(), "users");
        assert_eq!(*config.max_batch_size(), 0);
        assert_eq!(config.batch_limit(), 1);
    }
}
