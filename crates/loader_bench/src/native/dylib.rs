//! Binding to the storage-to-GPU loader shipped as a C shared library.
//!
//! The library must export:
//!
//! ```c
//! int  sil_init(const SilConfig *cfg, void **handle, uint64_t *total_samples);
//! int  sil_next(void *handle, const SilBuffer **buffers, uint64_t *count);
//! void sil_term(void *handle);
//! const char *sil_last_error(void);
//! ```
//!
//! Status codes are 0 on success. Buffers returned by `sil_next` stay owned by the
//! library and remain valid until `sil_term`.

use super::{LoaderConfig, NativeLoader, RawDescriptor};
use crate::batch::DType;
use crate::error::{LoaderError, Result};
use anyhow::anyhow;
use libloading::Library;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use tch::Device;

#[repr(C)]
struct SilConfig {
    device: *const c_char,
    data_dir: *const c_char,
    backend: *const c_char,
    mnt: *const c_char,
    batch_size: u64,
    gpu_nqueues: u32,
    queue_depth: u32,
    gpu_index: i32,
}

#[repr(C)]
struct SilBuffer {
    data: *const c_void,
    shape: *const i64,
    ndim: u32,
    dtype: u32,
}

type InitFn = unsafe extern "C" fn(*const SilConfig, *mut *mut c_void, *mut u64) -> c_int;
type NextFn = unsafe extern "C" fn(*mut c_void, *mut *const SilBuffer, *mut u64) -> c_int;
type TermFn = unsafe extern "C" fn(*mut c_void);
type LastErrorFn = unsafe extern "C" fn() -> *const c_char;

/// Entry points of the loader ABI.
#[derive(Clone, Copy)]
pub(crate) struct Symbols {
    init: InitFn,
    next: NextFn,
    term: TermFn,
    last_error: LastErrorFn,
}

impl Symbols {
    /// # Safety
    /// `library` must implement the ABI documented at the top of this module.
    unsafe fn resolve(library: &Library) -> std::result::Result<Self, libloading::Error> {
        Ok(Self {
            init: *library.get::<InitFn>(b"sil_init\0")?,
            next: *library.get::<NextFn>(b"sil_next\0")?,
            term: *library.get::<TermFn>(b"sil_term\0")?,
            last_error: *library.get::<LastErrorFn>(b"sil_last_error\0")?,
        })
    }
}

/// Native loader handle backed by the shared library.
pub struct DylibLoader {
    backend: String,
    handle: *mut c_void,
    device: Device,
    symbols: Symbols,
    // Keeps the function pointers above valid. Declared last so it is dropped
    // after the handle has been terminated. `None` when the symbols are linked
    // into the process.
    _library: Option<Library>,
}

impl DylibLoader {
    /// Loads the library, resolves the ABI and initialises one handle.
    pub fn init(config: &LoaderConfig) -> Result<(Self, usize)> {
        // SAFETY: loading runs the library's initialisers; the path is an explicit
        // operator choice and the library is expected to implement the ABI above.
        let library = unsafe { Library::new(&config.library) }.map_err(|e| {
            LoaderError::backend_init(
                &config.backend,
                format!("cannot load {}: {e}", config.library.display()),
            )
        })?;

        // SAFETY: symbol types match the documented ABI.
        let symbols = unsafe { Symbols::resolve(&library) }.map_err(|e| {
            LoaderError::backend_init(&config.backend, format!("missing loader symbol: {e}"))
        })?;

        Self::from_symbols(symbols, config, Some(library))
    }

    /// Initialises one handle through already resolved entry points.
    pub(crate) fn from_symbols(
        symbols: Symbols,
        config: &LoaderConfig,
        library: Option<Library>,
    ) -> Result<(Self, usize)> {
        let init_error = |reason: String| LoaderError::backend_init(&config.backend, reason);

        let device = c_string(&config.device, &init_error)?;
        let data_dir = c_string(&path_str(&config.data_dir), &init_error)?;
        let backend = c_string(&config.backend, &init_error)?;
        let mnt = c_string(&config.mnt, &init_error)?;
        let gpu_index = match config.gpu {
            Device::Cuda(index) => index as i32,
            _ => -1,
        };
        let raw_config = SilConfig {
            device: device.as_ptr(),
            data_dir: data_dir.as_ptr(),
            backend: backend.as_ptr(),
            mnt: mnt.as_ptr(),
            batch_size: config.batch_size as u64,
            gpu_nqueues: config.gpu_nqueues,
            queue_depth: config.queue_depth,
            gpu_index,
        };

        let mut handle: *mut c_void = std::ptr::null_mut();
        let mut total: u64 = 0;
        // SAFETY: all pointers in `raw_config` outlive the call.
        let status = unsafe { (symbols.init)(&raw_config, &mut handle, &mut total) };
        if status != 0 || handle.is_null() {
            // SAFETY: resolved alongside `init`.
            let reason = unsafe { last_error(symbols.last_error) };
            return Err(init_error(format!("sil_init returned {status}: {reason}")));
        }

        tracing::debug!(
            backend = %config.backend,
            device = %config.device,
            total,
            queue_depth = config.queue_depth,
            gpu_nqueues = config.gpu_nqueues,
            "native loader initialised"
        );

        let loader = Self {
            backend: config.backend.clone(),
            handle,
            device: config.gpu,
            symbols,
            _library: library,
        };
        Ok((loader, total as usize))
    }
}

impl NativeLoader for DylibLoader {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn next(&mut self) -> Result<Vec<RawDescriptor>> {
        if self.handle.is_null() {
            return Err(LoaderError::UseAfterRelease);
        }

        let mut buffers: *const SilBuffer = std::ptr::null();
        let mut count: u64 = 0;
        // SAFETY: `handle` is live (non-null, not yet terminated).
        let status = unsafe { (self.symbols.next)(self.handle, &mut buffers, &mut count) };
        if status != 0 {
            // SAFETY: resolved from the loaded library.
            let reason = unsafe { last_error(self.symbols.last_error) };
            return Err(anyhow!("sil_next returned {status}: {reason}").into());
        }
        if count == 0 || buffers.is_null() {
            return Ok(Vec::new());
        }

        // SAFETY: the library returned `count` contiguous buffers that stay valid until term.
        let buffers = unsafe { std::slice::from_raw_parts(buffers, count as usize) };
        buffers
            .iter()
            .map(|buffer| {
                let dtype = DType::from_code(buffer.dtype)
                    .ok_or_else(|| anyhow!("sil_next returned unknown dtype {}", buffer.dtype))?;
                let shape = if buffer.ndim == 0 || buffer.shape.is_null() {
                    Vec::new()
                } else {
                    // SAFETY: `shape` points at `ndim` dimensions per the ABI.
                    unsafe { std::slice::from_raw_parts(buffer.shape, buffer.ndim as usize) }
                        .to_vec()
                };
                Ok(RawDescriptor {
                    ptr: buffer.data as *const u8,
                    shape,
                    dtype,
                    device: self.device,
                })
            })
            .collect()
    }

    fn term(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: called at most once per handle; the library is still loaded.
            unsafe { (self.symbols.term)(self.handle) };
            self.handle = std::ptr::null_mut();
            tracing::debug!(backend = %self.backend, "native loader terminated");
        }
    }
}

impl Drop for DylibLoader {
    fn drop(&mut self) {
        self.term();
    }
}

fn c_string(value: &str, init_error: &impl Fn(String) -> LoaderError) -> Result<CString> {
    CString::new(value).map_err(|_| init_error(format!("interior NUL in '{value}'")))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// # Safety
/// `f` must be the library's `sil_last_error`.
unsafe fn last_error(f: LastErrorFn) -> String {
    let message = f();
    if message.is_null() {
        return "unknown error".to_string();
    }
    CStr::from_ptr(message).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ZeroCopyIterator;
    use std::cell::{Cell, RefCell};

    static DATA: [u8; 16] = [7; 16];
    static SHAPE: [i64; 2] = [2, 8];
    static HANDLE: u8 = 0;

    thread_local! {
        static BUFFERS: RefCell<Vec<SilBuffer>> = const { RefCell::new(Vec::new()) };
        static TERMS: Cell<usize> = const { Cell::new(0) };
        static SEEN_BATCH_SIZE: Cell<u64> = const { Cell::new(0) };
    }

    fn buffer(ndim: u32, shape: *const i64, dtype: u32) -> SilBuffer {
        SilBuffer {
            data: DATA.as_ptr().cast(),
            shape,
            ndim,
            dtype,
        }
    }

    fn set_buffers(buffers: Vec<SilBuffer>) {
        BUFFERS.with(|b| *b.borrow_mut() = buffers);
    }

    unsafe extern "C" fn init_ok(cfg: *const SilConfig, handle: *mut *mut c_void, total: *mut u64) -> c_int {
        SEEN_BATCH_SIZE.with(|s| s.set((*cfg).batch_size));
        *handle = (&HANDLE as *const u8).cast_mut().cast();
        *total = 6;
        0
    }

    unsafe extern "C" fn init_failing(_: *const SilConfig, _: *mut *mut c_void, _: *mut u64) -> c_int {
        3
    }

    unsafe extern "C" fn init_without_handle(_: *const SilConfig, _: *mut *mut c_void, total: *mut u64) -> c_int {
        *total = 6;
        0
    }

    unsafe extern "C" fn next_ok(_: *mut c_void, buffers: *mut *const SilBuffer, count: *mut u64) -> c_int {
        BUFFERS.with(|b| {
            let b = b.borrow();
            *buffers = b.as_ptr();
            *count = b.len() as u64;
        });
        0
    }

    unsafe extern "C" fn next_failing(_: *mut c_void, _: *mut *const SilBuffer, _: *mut u64) -> c_int {
        -5
    }

    unsafe extern "C" fn term_counting(_: *mut c_void) {
        TERMS.with(|t| t.set(t.get() + 1));
    }

    unsafe extern "C" fn last_error_message() -> *const c_char {
        b"queue 2 timed out\0".as_ptr().cast()
    }

    unsafe extern "C" fn last_error_null() -> *const c_char {
        std::ptr::null()
    }

    fn symbols(init: InitFn, next: NextFn) -> Symbols {
        Symbols {
            init,
            next,
            term: term_counting,
            last_error: last_error_message,
        }
    }

    fn config() -> LoaderConfig {
        LoaderConfig::builder()
            .backend("fake")
            .batch_size(2)
            .gpu(Device::Cpu)
            .build()
    }

    fn open(symbols: Symbols) -> Result<(DylibLoader, usize)> {
        DylibLoader::from_symbols(symbols, &config(), None)
    }

    #[test]
    fn test_init_reports_total_and_config() -> Result<()> {
        let (loader, total) = open(symbols(init_ok, next_ok))?;
        assert_eq!(total, 6);
        assert_eq!(loader.backend(), "fake");
        assert_eq!(SEEN_BATCH_SIZE.with(Cell::get), 2);
        Ok(())
    }

    #[test]
    fn test_init_status_maps_to_backend_init_with_last_error() {
        let Err(err) = open(symbols(init_failing, next_ok)) else {
            panic!("non-zero sil_init status must fail");
        };
        assert!(matches!(err, LoaderError::BackendInit { .. }));
        let message = err.to_string();
        assert!(message.contains("fake"), "{message}");
        assert!(message.contains("sil_init returned 3"), "{message}");
        assert!(message.contains("queue 2 timed out"), "{message}");
        assert_eq!(TERMS.with(Cell::get), 0);
    }

    #[test]
    fn test_init_without_handle_is_init_error() {
        let mut symbols = symbols(init_without_handle, next_ok);
        symbols.last_error = last_error_null;
        let Err(err) = open(symbols) else {
            panic!("a null handle must fail");
        };
        assert!(matches!(err, LoaderError::BackendInit { .. }));
        assert!(err.to_string().contains("unknown error"));
    }

    #[test]
    fn test_next_converts_buffers() -> Result<()> {
        let (mut loader, _) = open(symbols(init_ok, next_ok))?;
        set_buffers(vec![
            buffer(2, SHAPE.as_ptr(), DType::U8.code()),
            buffer(0, SHAPE.as_ptr(), DType::F32.code()),
            buffer(2, std::ptr::null(), DType::I32.code()),
        ]);

        let descriptors = loader.next()?;
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].shape, vec![2, 8]);
        assert_eq!(descriptors[0].dtype, DType::U8);
        assert_eq!(descriptors[0].ptr, DATA.as_ptr());
        assert_eq!(descriptors[0].device, Device::Cpu);
        // Scalars and missing shapes both become rank 0.
        assert!(descriptors[1].shape.is_empty());
        assert!(descriptors[2].shape.is_empty());
        assert_eq!(descriptors[2].dtype, DType::I32);
        Ok(())
    }

    #[test]
    fn test_empty_next_yields_no_descriptors() -> Result<()> {
        let (mut loader, _) = open(symbols(init_ok, next_ok))?;
        set_buffers(Vec::new());
        assert!(loader.next()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_dtype_is_unclassified_error() -> Result<()> {
        let (mut loader, _) = open(symbols(init_ok, next_ok))?;
        set_buffers(vec![buffer(2, SHAPE.as_ptr(), 42)]);
        let err = loader.next().unwrap_err();
        assert!(matches!(err, LoaderError::Backend(_)));
        assert!(err.to_string().contains("unknown dtype 42"));
        Ok(())
    }

    #[test]
    fn test_next_status_maps_to_unclassified_error() -> Result<()> {
        let (mut loader, _) = open(symbols(init_ok, next_failing))?;
        let err = loader.next().unwrap_err();
        assert!(matches!(err, LoaderError::Backend(_)));
        assert_eq!(err.to_string(), "sil_next returned -5: queue 2 timed out");
        Ok(())
    }

    #[test]
    fn test_next_after_term_fails() -> Result<()> {
        let (mut loader, _) = open(symbols(init_ok, next_ok))?;
        loader.term();
        assert!(matches!(loader.next(), Err(LoaderError::UseAfterRelease)));
        Ok(())
    }

    #[test]
    fn test_term_runs_once_across_release_and_drop() -> Result<()> {
        let (loader, total) = open(symbols(init_ok, next_ok))?;
        let mut adapter = ZeroCopyIterator::from_loader(Box::new(loader), total, 2);
        adapter.release();
        adapter.release();
        drop(adapter);
        assert_eq!(TERMS.with(Cell::get), 1);
        Ok(())
    }
}
