//! src/view.rs
//!
//! # Zero-Copy Device Array Views
//!
//! A native loader hands back raw `(pointer, shape, dtype)` descriptors for memory it
//! owns, usually already resident on the GPU. Copying that memory would defeat the
//! point of measuring direct-transfer throughput, so batches expose it as
//! [`DeviceArrayView`]s: typed metadata plus the raw pointer, never the bytes.
//!
//! # Lifetime Model
//!
//! ```text
//!   ZeroCopyIterator                           Batch
//!   ┌──────────────────────┐                   ┌────────────────────┐
//!   │ NativeLoader handle  │── owns memory ──▶ │ DeviceArrayView    │
//!   │ OwnerScope (live=1)  │── issues lease ─▶ │   ptr @0x7f00      │
//!   └──────────────────────┘                   │   lease ─┐         │
//!             │                                └──────────┼─────────┘
//!          release()                                      │
//!             ▼                                           ▼
//!   ┌──────────────────────┐                   ┌────────────────────┐
//!   │ handle terminated    │                   │ as_ptr()  → Err    │
//!   │ OwnerScope (live=0)  │                   │ with_tensor → Err  │
//!   └──────────────────────┘                   └────────────────────┘
//! ```
//!
//! The adapter is the only owner. A lease does not keep anything alive; it only
//! observes whether the owning scope is still open, so every access after
//! `release()` fails with [`LoaderError::UseAfterRelease`] instead of touching freed
//! memory. Leases are `Rc`-based and views hold raw pointers, which keeps both the
//! adapter and its views on the thread that created them.

use crate::batch::DType;
use crate::error::{LoaderError, Result};
use crate::native::RawDescriptor;
use std::cell::Cell;
use std::rc::Rc;
use tch::{Device, Tensor};

/// Owning side of the lease pair. Lives inside the adapter.
#[derive(Debug)]
pub(crate) struct OwnerScope {
    live: Rc<Cell<bool>>,
}

impl OwnerScope {
    pub(crate) fn new() -> Self {
        Self {
            live: Rc::new(Cell::new(true)),
        }
    }

    pub(crate) fn lease(&self) -> Lease {
        Lease {
            live: Rc::clone(&self.live),
        }
    }

    /// Invalidates every lease issued so far. Idempotent.
    pub(crate) fn close(&self) {
        self.live.set(false);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.live.get()
    }
}

/// Non-owning token held by a view.
#[derive(Debug, Clone)]
pub(crate) struct Lease {
    live: Rc<Cell<bool>>,
}

impl Lease {
    fn is_live(&self) -> bool {
        self.live.get()
    }
}

/// Typed, non-owning window onto loader-owned device memory.
#[derive(Debug)]
pub struct DeviceArrayView {
    ptr: *const u8,
    shape: Vec<i64>,
    dtype: DType,
    device: Device,
    size_bytes: usize,
    lease: Lease,
}

impl DeviceArrayView {
    pub(crate) fn new(descriptor: RawDescriptor, lease: Lease) -> Self {
        let size_bytes = descriptor.size_bytes();
        Self {
            ptr: descriptor.ptr,
            shape: descriptor.shape,
            dtype: descriptor.dtype,
            device: descriptor.device,
            size_bytes,
            lease,
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Whether the owning adapter still holds its native handle.
    pub fn is_live(&self) -> bool {
        self.lease.is_live()
    }

    /// The raw device pointer, or `UseAfterRelease` once the owner is gone.
    pub fn as_ptr(&self) -> Result<*const u8> {
        if !self.is_live() {
            return Err(LoaderError::UseAfterRelease);
        }
        Ok(self.ptr)
    }

    /// Runs `f` on a tensor aliasing the view's memory.
    ///
    /// Fails with `UseAfterRelease` once the owner is gone. For a tensor that may
    /// outlive the adapter use [`DeviceArrayView::to_owned_tensor`].
    ///
    /// # Safety
    ///
    /// The tensor passed to `f` does not own its storage. Neither it nor anything
    /// sharing its storage (`shallow_clone`, `view`, `narrow`, `reshape`, `slice`,
    /// ...) may be returned from `f` or otherwise outlive the call, since the
    /// memory is freed when the owning adapter is released.
    pub unsafe fn with_tensor<R>(&self, f: impl FnOnce(&Tensor) -> R) -> Result<R> {
        let ptr = self.as_ptr()?;
        let strides = contiguous_strides(&self.shape);
        // SAFETY: the lease is live, so the native handle that owns `ptr` has not
        // been terminated, and the descriptor promised `shape`/`dtype` describe a
        // contiguous buffer of `size_bytes` on `device`.
        let tensor = unsafe {
            Tensor::from_blob(ptr, &self.shape, &strides, self.dtype.kind(), self.device)
        };
        Ok(f(&tensor))
    }

    /// Deep copy into a tensor that owns its memory.
    ///
    /// This is the only safe way to get a tensor out of a view:
    ///
    /// ```no_run
    /// # fn first(view: &loader_bench::DeviceArrayView) -> loader_bench::Result<()> {
    /// let owned = view.to_owned_tensor()?;
    /// assert_ne!(owned.data_ptr() as *const u8, view.as_ptr()?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn to_owned_tensor(&self) -> Result<Tensor> {
        // SAFETY: `copy` allocates fresh storage; the aliasing tensor is dropped
        // before returning.
        unsafe { self.with_tensor(|tensor| tensor.copy()) }
    }
}

/// Row-major strides, in elements.
fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(1);
    }
    strides
}
