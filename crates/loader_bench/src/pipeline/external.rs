use super::Pipeline;
use crate::adapter::ZeroCopyIterator;
use crate::batch::BatchResult;
use crate::error::{LoaderError, Result};
use crate::native::LoaderConfig;

const NAME: &str = "adapter";

/// Pipeline whose only source is a [`ZeroCopyIterator`].
///
/// Owns exactly one adapter, so the native handle is never shared. Dropping the
/// pipeline releases the handle.
pub struct AdapterPipeline {
    config: Option<LoaderConfig>,
    source: Option<ZeroCopyIterator>,
}

impl AdapterPipeline {
    /// The adapter is constructed on `build()`.
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config: Some(config),
            source: None,
        }
    }

    /// Uses an already constructed adapter; `build()` is then a no-op.
    pub fn from_iterator(source: ZeroCopyIterator) -> Self {
        Self {
            config: None,
            source: Some(source),
        }
    }

    pub fn source(&self) -> Option<&ZeroCopyIterator> {
        self.source.as_ref()
    }

    fn source_mut(&mut self) -> Result<&mut ZeroCopyIterator> {
        self.source
            .as_mut()
            .ok_or_else(|| LoaderError::PipelineNotBuilt(NAME.to_string()))
    }
}

impl Pipeline for AdapterPipeline {
    fn name(&self) -> &str {
        NAME
    }

    fn build(&mut self) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        if let Some(mut previous) = self.source.take() {
            previous.release();
        }
        self.source = Some(ZeroCopyIterator::new(config)?);
        Ok(())
    }

    fn run(&mut self) -> Result<BatchResult> {
        self.source_mut()?.produce_next()
    }

    fn reset(&mut self) -> Result<()> {
        self.source_mut()?.reset();
        Ok(())
    }
}
