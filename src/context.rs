//! User contexts: opaque parameter data passed to pointwise functions.
use crate::ceed::{Ceed, CopyMode, MemType};
use crate::error::{OperatorError, Result};
use log::warn;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A byte buffer owned by the caller and shared with a context
/// (see [`ContextSource::UsePointer`]).
pub type SharedContextBuffer = Arc<Mutex<Vec<u8>>>;

/// Data handed to [`Context::set_data`]. The variant determines the [`CopyMode`].
#[derive(Debug)]
pub enum ContextSource<'a> {
    /// The bytes are copied into storage owned by the context.
    CopyValues(&'a [u8]),
    /// The context takes ownership of the buffer.
    OwnPointer(Vec<u8>),
    /// The context only keeps a reference; the caller retains ownership.
    UsePointer(SharedContextBuffer),
}

impl<'a> ContextSource<'a> {
    pub fn copy_mode(&self) -> CopyMode {
        match self {
            Self::CopyValues(_) => CopyMode::CopyValues,
            Self::OwnPointer(_) => CopyMode::OwnPointer,
            Self::UsePointer(_) => CopyMode::UsePointer,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::CopyValues(bytes) => bytes.len(),
            Self::OwnPointer(bytes) => bytes.len(),
            Self::UsePointer(buffer) => buffer.lock().len(),
        }
    }
}

#[derive(Debug)]
struct ContextState {
    buffer: Option<SharedContextBuffer>,
    size: Option<usize>,
    mem_type: MemType,
    copy_mode: Option<CopyMode>,
}

#[derive(Debug)]
struct ContextCore {
    state: Mutex<ContextState>,
    borrowed: AtomicBool,
    supports_device: bool,
}

impl Drop for ContextCore {
    fn drop(&mut self) {
        if self.borrowed.load(Ordering::Acquire) {
            warn!("user context released while its data was still borrowed");
        }
    }
}

/// Reference-counted container for user-defined parameter data.
///
/// The size of the data is fixed by the first call to [`Context::set_data`]. At most one
/// borrow obtained through [`Context::get_data`] may be outstanding at a time, and it must be
/// ended with [`Context::restore_data`] before the data can be borrowed again.
#[derive(Debug, Clone)]
pub struct Context {
    core: Arc<ContextCore>,
}

impl Context {
    /// Create an empty context with no backing buffer.
    pub fn create(ceed: &Ceed) -> Self {
        Self {
            core: Arc::new(ContextCore {
                state: Mutex::new(ContextState {
                    buffer: None,
                    size: None,
                    mem_type: MemType::Host,
                    copy_mode: None,
                }),
                borrowed: AtomicBool::new(false),
                supports_device: ceed.supports(MemType::Device),
            }),
        }
    }

    fn check_mem_type(&self, mem_type: MemType) -> Result<()> {
        if mem_type == MemType::Device && !self.core.supports_device {
            return Err(OperatorError::invalid_state(
                "Context",
                "device memory is not available on this backend",
            ));
        }
        Ok(())
    }

    /// Set the data of the context, releasing any buffer it previously owned.
    pub fn set_data(&self, mem_type: MemType, source: ContextSource) -> Result<()> {
        self.check_mem_type(mem_type)?;
        if self.is_borrowed() {
            return Err(OperatorError::invalid_state(
                "Context",
                "cannot set data while the data is borrowed",
            ));
        }
        let len = source.len();
        if len == 0 {
            return Err(OperatorError::incompatible_shape("Context", "context data must not be empty"));
        }

        let mut state = self.core.state.lock();
        if let Some(size) = state.size {
            if size != len {
                return Err(OperatorError::incompatible_shape(
                    "Context",
                    format!("context size is fixed at {size} bytes, got {len} bytes"),
                ));
            }
        }

        let copy_mode = source.copy_mode();
        let buffer = match source {
            ContextSource::CopyValues(bytes) => Arc::new(Mutex::new(bytes.to_vec())),
            ContextSource::OwnPointer(bytes) => Arc::new(Mutex::new(bytes)),
            ContextSource::UsePointer(buffer) => buffer,
        };
        // Dropping our handle to a previous buffer frees it only if the context owned it
        state.buffer = Some(buffer);
        state.size = Some(len);
        state.mem_type = mem_type;
        state.copy_mode = Some(copy_mode);
        Ok(())
    }

    /// Copy an array of scalars into the context.
    pub fn set_scalars(&self, mem_type: MemType, values: &[f64]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.set_data(mem_type, ContextSource::OwnPointer(bytes))
    }

    /// Size of the data in bytes, or zero if no data has been set.
    pub fn size(&self) -> usize {
        self.core.state.lock().size.unwrap_or(0)
    }

    pub fn mem_type(&self) -> MemType {
        self.core.state.lock().mem_type
    }

    pub fn copy_mode(&self) -> Option<CopyMode> {
        self.core.state.lock().copy_mode
    }

    pub fn is_borrowed(&self) -> bool {
        self.core.borrowed.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Borrow the data for reading and writing in the given memory space.
    pub fn get_data(&self, mem_type: MemType) -> Result<ContextDataMut> {
        self.check_mem_type(mem_type)?;
        if self
            .core
            .borrowed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OperatorError::invalid_state(
                "Context",
                "data is already borrowed; restore it before borrowing again",
            ));
        }

        let buffer = {
            let mut state = self.core.state.lock();
            state.mem_type = mem_type;
            state.buffer.clone()
        };
        let guard = buffer.and_then(|buffer| buffer.try_lock_arc());
        let result = match guard {
            Some(guard) => check_size(guard.len(), self.core.state.lock().size).map(|_| ContextDataMut {
                context: self.clone(),
                guard,
            }),
            None => Err(OperatorError::invalid_state(
                "Context",
                "no data available (not set, or a previous view is still alive)",
            )),
        };
        if result.is_err() {
            self.core.borrowed.store(false, Ordering::Release);
        }
        result
    }

    /// End the outstanding borrow.
    pub fn restore_data(&self) -> Result<()> {
        if self
            .core
            .borrowed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OperatorError::invalid_state("Context", "data is not borrowed"));
        }
        Ok(())
    }

    /// Copy the context data out as scalars.
    pub fn scalars(&self) -> Result<Vec<f64>> {
        Ok(self.bytes()?.map(|bytes| as_scalars(&bytes)).unwrap_or_default())
    }

    /// Snapshot of the data, used when evaluating pointwise functions.
    pub(crate) fn bytes(&self) -> Result<Option<Vec<u8>>> {
        if self.is_borrowed() {
            return Err(OperatorError::invalid_state(
                "Context",
                "data is borrowed and cannot be read by a pointwise function",
            ));
        }
        let (buffer, size) = {
            let state = self.core.state.lock();
            (state.buffer.clone(), state.size)
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => return Ok(None),
        };
        let bytes = buffer.try_lock().ok_or_else(|| {
            OperatorError::invalid_state("Context", "data is still held by a view obtained from get_data")
        })?;
        check_size(bytes.len(), size)?;
        Ok(Some(bytes.clone()))
    }

    /// Release this handle.
    ///
    /// Fails if the data is currently borrowed. The handle is consumed either way; the
    /// storage itself lives on as long as any other handle or borrow refers to it.
    pub fn destroy(self) -> Result<()> {
        if self.is_borrowed() {
            return Err(OperatorError::invalid_state(
                "Context",
                "cannot destroy while the data is borrowed",
            ));
        }
        Ok(())
    }

    /// Write a textual description of the context.
    pub fn view(&self, writer: &mut impl io::Write) -> io::Result<()> {
        write!(writer, "{}", self)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        writeln!(f, "UserContext")?;
        writeln!(f, "  Context Data Size: {}", state.size.unwrap_or(0))?;
        writeln!(f, "  Memory: {:?}", state.mem_type)?;
        match state.copy_mode {
            Some(mode) => writeln!(f, "  Copy Mode: {:?}", mode),
            None => writeln!(f, "  Copy Mode: unset"),
        }
    }
}

/// Exclusive access to the data of a [`Context`].
///
/// Dropping the view releases the data for use, but the context stays borrowed until
/// [`ContextDataMut::restore`] or [`Context::restore_data`] is called.
pub struct ContextDataMut {
    context: Context,
    guard: ArcMutexGuard<RawMutex, Vec<u8>>,
}

impl ContextDataMut {
    /// Interpret the data as native-endian scalars.
    pub fn to_scalars(&self) -> Vec<f64> {
        as_scalars(&self.guard)
    }

    /// Overwrite the data with native-endian scalars.
    ///
    /// # Panics
    ///
    /// Panics if `values` does not occupy exactly the size of the data.
    pub fn copy_from_scalars(&mut self, values: &[f64]) {
        assert_eq!(values.len() * 8, self.guard.len(), "scalar data must fill the context");
        for (chunk, value) in self.guard.chunks_exact_mut(8).zip(values) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// End the borrow.
    pub fn restore(self) -> Result<()> {
        let context = self.context.clone();
        drop(self);
        context.restore_data()
    }
}

impl fmt::Debug for ContextDataMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextDataMut")
            .field("len", &self.guard.len())
            .finish()
    }
}

impl Deref for ContextDataMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for ContextDataMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// A buffer shared through [`ContextSource::UsePointer`] may be resized by its owner after
/// it was handed to the context.
fn check_size(len: usize, size: Option<usize>) -> Result<()> {
    match size {
        Some(size) if size != len => Err(OperatorError::incompatible_shape(
            "Context",
            format!("context size is fixed at {size} bytes, but the data now has {len} bytes"),
        )),
        _ => Ok(()),
    }
}

/// Interpret a context byte buffer as native-endian `f64` values.
///
/// Trailing bytes that do not form a complete scalar are ignored.
pub fn as_scalars(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_ne_bytes(raw)
        })
        .collect()
}
