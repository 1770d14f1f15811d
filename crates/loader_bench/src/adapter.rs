//! src/adapter.rs
//!
//! Zero-copy iterator adapter over a native loader handle.
//!
//! The adapter turns the handle's `next()` into the uniform "produce next batch"
//! protocol used by pipelines:
//!
//! ```text
//!   produce_next()
//!        │
//!        ├── released?          → Err(UseAfterRelease)
//!        ├── cursor >= total?   → reset(), Ok(EndOfEpoch)
//!        └── otherwise          → handle.next() → [RawDescriptor]
//!                                   → [DeviceArrayView] (leased, no copy)
//!                                   + zero Int32 labels [batch_size]
//!                                   → cursor += batch_size
//! ```
//!
//! The cursor only delimits epochs. The handle streams cyclically and decides on its
//! own how to fill the final batch (padding or a short batch).

use crate::batch::{Batch, BatchResult, DeviceArray};
use crate::error::{LoaderError, Result};
use crate::native::{self, LoaderConfig, NativeLoader};
use crate::view::{DeviceArrayView, OwnerScope};
use tch::Device;

/// Single-owner adapter. Views it hands out are valid until [`ZeroCopyIterator::release`].
pub struct ZeroCopyIterator {
    loader: Option<Box<dyn NativeLoader>>,
    scope: OwnerScope,
    batch_size: usize,
    total: usize,
    cursor: usize,
    label_device: Device,
}

impl ZeroCopyIterator {
    /// Initialises the native loader described by `config`.
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let (loader, total) = native::open(config)?;
        tracing::debug!(
            backend = %config.backend,
            total,
            batch_size = config.batch_size,
            "zero-copy adapter constructed"
        );
        Ok(Self::from_loader(loader, total, config.batch_size).with_label_device(config.gpu))
    }

    /// Wraps an already initialised handle that reported `total` samples.
    pub fn from_loader(loader: Box<dyn NativeLoader>, total: usize, batch_size: usize) -> Self {
        Self {
            loader: Some(loader),
            scope: OwnerScope::new(),
            batch_size,
            total,
            cursor: 0,
            label_device: Device::Cpu,
        }
    }

    /// Device the placeholder labels are allocated on.
    pub fn with_label_device(mut self, device: Device) -> Self {
        self.label_device = device;
        self
    }

    /// Starts a new epoch.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Produces the next batch, or `EndOfEpoch` exactly once per epoch boundary.
    pub fn produce_next(&mut self) -> Result<BatchResult> {
        let loader = self.loader.as_mut().ok_or(LoaderError::UseAfterRelease)?;

        if self.cursor >= self.total {
            self.reset();
            return Ok(BatchResult::EndOfEpoch);
        }

        let descriptors = loader.next()?;
        let images = descriptors
            .into_iter()
            .map(|descriptor| DeviceArray::View(DeviceArrayView::new(descriptor, self.scope.lease())))
            .collect();
        // Labels are placeholders; the native loader does not report them.
        let labels = Batch::zero_labels(self.batch_size, self.label_device);

        self.cursor = (self.cursor + self.batch_size).min(self.total);
        Ok(BatchResult::Batch(Batch::new(images, labels)))
    }

    /// Terminates the native handle and invalidates every view handed out.
    /// Idempotent; also run on drop.
    pub fn release(&mut self) {
        if let Some(mut loader) = self.loader.take() {
            loader.term();
            self.scope.close();
            tracing::debug!(backend = loader.backend(), "zero-copy adapter released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.loader.is_none()
    }

    /// Samples per epoch as reported by the handle.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Iterates one epoch. The boundary resets the cursor and ends iteration, so the
/// next `for` loop starts a fresh epoch.
impl Iterator for ZeroCopyIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.produce_next() {
            Ok(BatchResult::Batch(batch)) => Some(Ok(batch)),
            Ok(BatchResult::EndOfEpoch) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for ZeroCopyIterator {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{HostLoader, RawDescriptor, HOST_BACKEND};
    use std::cell::Cell;
    use std::rc::Rc;

    fn adapter(total: usize, batch_size: usize) -> ZeroCopyIterator {
        ZeroCopyIterator::from_loader(
            Box::new(HostLoader::synthetic(total, 16, batch_size)),
            total,
            batch_size,
        )
    }

    /// Counts `term` calls.
    struct CountingLoader {
        terms: Rc<Cell<usize>>,
    }

    impl NativeLoader for CountingLoader {
        fn backend(&self) -> &str {
            "counting"
        }

        fn next(&mut self) -> Result<Vec<RawDescriptor>> {
            Ok(Vec::new())
        }

        fn term(&mut self) {
            self.terms.set(self.terms.get() + 1);
        }
    }

    #[test]
    fn test_batch_size_32_total_100() -> Result<()> {
        let mut it = adapter(100, 32);
        let mut sizes = Vec::new();
        for _ in 0..4 {
            match it.produce_next()? {
                BatchResult::Batch(batch) => sizes.push(batch.len()),
                BatchResult::EndOfEpoch => panic!("epoch ended early"),
            }
            assert!(it.cursor() <= it.len());
        }
        // The loader short-batches the tail.
        assert_eq!(sizes, vec![32, 32, 32, 4]);
        assert!(it.produce_next()?.is_end_of_epoch());
        assert_eq!(it.cursor(), 0);
        Ok(())
    }

    #[test]
    fn test_ceil_batches_cover_every_epoch() -> Result<()> {
        for total in [0usize, 1, 7, 10, 40, 63, 64, 65] {
            for batch_size in [1usize, 3, 8, 10, 64] {
                let mut it = adapter(total, batch_size);
                let expected = total.div_ceil(batch_size);
                for epoch in 0..2 {
                    for i in 0..expected {
                        let result = it.produce_next()?;
                        assert!(
                            !result.is_end_of_epoch(),
                            "total={total} bs={batch_size} epoch={epoch}: ended at batch {i}"
                        );
                    }
                    assert!(it.produce_next()?.is_end_of_epoch());
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_labels_are_zero_placeholders() -> Result<()> {
        let mut it = adapter(10, 4);
        let batch = it.produce_next()?.into_batch().unwrap();
        let labels = batch.labels();
        assert_eq!(labels.size(), vec![4]);
        assert_eq!(labels.kind(), tch::Kind::Int);
        assert_eq!(labels.abs().sum(tch::Kind::Int64).int64_value(&[]), 0);
        Ok(())
    }

    #[test]
    fn test_views_alias_loader_memory() -> Result<()> {
        let mut it = adapter(3, 3);
        let batch = it.produce_next()?.into_batch().unwrap();
        for (i, image) in batch.images().iter().enumerate() {
            let DeviceArray::View(view) = image else {
                panic!("adapter must hand out views");
            };
            assert_eq!(view.shape(), &[16]);
            // SAFETY: only a scalar leaves the closure.
            let first = unsafe { view.with_tensor(|t| t.int64_value(&[0])) }?;
            assert_eq!(first, i as i64);
        }
        Ok(())
    }

    #[test]
    fn test_reset_after_exhaustion() -> Result<()> {
        let mut it = adapter(4, 2);
        while !it.produce_next()?.is_end_of_epoch() {}
        it.reset();
        it.reset();
        assert_eq!(it.cursor(), 0);

        it.produce_next()?;
        assert_eq!(it.cursor(), 2);
        it.reset();
        assert_eq!(it.cursor(), 0);
        Ok(())
    }

    #[test]
    fn test_release_is_idempotent() {
        let terms = Rc::new(Cell::new(0));
        let mut it = ZeroCopyIterator::from_loader(
            Box::new(CountingLoader {
                terms: Rc::clone(&terms),
            }),
            8,
            2,
        );
        it.release();
        it.release();
        assert!(it.is_released());
        drop(it);
        assert_eq!(terms.get(), 1);
    }

    #[test]
    fn test_drop_releases_unused_adapter() {
        let terms = Rc::new(Cell::new(0));
        {
            let _it = ZeroCopyIterator::from_loader(
                Box::new(CountingLoader {
                    terms: Rc::clone(&terms),
                }),
                0,
                1,
            );
        }
        assert_eq!(terms.get(), 1);
    }

    #[test]
    fn test_produce_after_release_fails() {
        let mut it = adapter(8, 2);
        it.release();
        assert!(matches!(
            it.produce_next(),
            Err(LoaderError::UseAfterRelease)
        ));
    }

    #[test]
    fn test_view_is_dead_after_release() -> Result<()> {
        let mut it = adapter(8, 2);
        let batch = it.produce_next()?.into_batch().unwrap();
        let DeviceArray::View(view) = &batch.images()[0] else {
            panic!("adapter must hand out views");
        };
        assert!(view.as_ptr().is_ok());

        it.release();
        assert!(!view.is_live());
        assert!(matches!(view.as_ptr(), Err(LoaderError::UseAfterRelease)));
        assert!(unsafe { view.with_tensor(|t| t.size()) }.is_err());
        assert!(matches!(
            view.to_owned_tensor(),
            Err(LoaderError::UseAfterRelease)
        ));
        Ok(())
    }

    #[test]
    fn test_owned_copy_survives_release() -> Result<()> {
        let mut it = adapter(4, 2);
        let batch = it.produce_next()?.into_batch().unwrap();
        let DeviceArray::View(view) = &batch.images()[1] else {
            panic!("adapter must hand out views");
        };
        let owned = view.to_owned_tensor()?;
        assert_ne!(owned.data_ptr() as *const u8, view.as_ptr()?);

        // term() frees the host loader's sample memory.
        it.release();
        assert_eq!(owned.size(), vec![16]);
        assert_eq!(owned.int64_value(&[0]), 1);
        Ok(())
    }

    #[test]
    fn test_iterator_yields_one_epoch() -> Result<()> {
        let mut it = adapter(10, 3);
        let first: Vec<Batch> = it.by_ref().collect::<Result<_>>()?;
        assert_eq!(first.len(), 4);
        let second = it.by_ref().count();
        assert_eq!(second, 4);
        Ok(())
    }

    #[test]
    fn test_new_with_host_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("{i}.bin")), [i as u8; 4])?;
        }
        let config = LoaderConfig::builder()
            .backend(HOST_BACKEND)
            .data_dir(dir.path())
            .batch_size(2)
            .gpu(Device::Cpu)
            .build();
        let it = ZeroCopyIterator::new(&config)?;
        assert_eq!(it.len(), 5);
        assert_eq!(it.count(), 3);
        Ok(())
    }
}
