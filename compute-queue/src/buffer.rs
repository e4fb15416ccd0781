//! Device buffers and their host views.
//!
//! Host-visible buffers (shared or managed storage) keep a host copy of their
//! bytes. Writes through [`Buffer::contents_mut`] mark the copy dirty and are
//! uploaded at the next commit that uses the buffer. Kernels that write such a
//! buffer have their results copied back into the host copy before the
//! command buffer reports completion. Private buffers have no host copy.
//!
//! Host views never block. Any number of read views may coexist, a write view
//! is exclusive, and a view that conflicts with another fails with
//! [`InvariantViolation::HostViewHeld`]. A commit takes the same locks without
//! waiting: read views may stay open across a commit that only reads the
//! buffer, while a commit that writes it, or uploads pending host writes,
//! needs every view dropped.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytemuck::Pod;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use wgpu::util::DeviceExt;

use crate::{
    device::{CapturedError, Device},
    error::{Error, InvariantViolation, Result, ValidationFailure},
    options::{ResourceOptions, StorageMode},
};

pub(crate) struct BufferShared {
    pub(crate) device_id: u64,
    pub(crate) raw: wgpu::Buffer,
    pub(crate) length: u64,
    options: ResourceOptions,
    shadow: Option<RwLock<Vec<u8>>>,
    dirty: AtomicBool,
    in_flight: AtomicUsize,
    pending_writes: AtomicUsize,
}

/// The host copy of one buffer, held by a commit while it submits.
pub(crate) enum HostLock<'a> {
    Shared(RwLockReadGuard<'a, Vec<u8>>),
    Exclusive(RwLockWriteGuard<'a, Vec<u8>>),
}

impl HostLock<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Shared(guard) => guard,
            Self::Exclusive(guard) => guard,
        }
    }
}

impl BufferShared {
    pub(crate) fn is_host_visible(&self) -> bool {
        self.shadow.is_some()
    }

    /// Locks the host copy for a commit without waiting.
    ///
    /// The lock is exclusive when the commit writes the buffer or has host
    /// writes to upload, shared otherwise. `Ok(None)` for private buffers.
    pub(crate) fn try_lock_host(
        &self,
        writes: bool,
    ) -> Result<Option<HostLock<'_>>, InvariantViolation> {
        let Some(shadow) = &self.shadow else {
            return Ok(None);
        };
        let lock = if writes || self.dirty.load(Ordering::Acquire) {
            shadow.try_write().map(HostLock::Exclusive)
        } else {
            shadow.try_read().map(HostLock::Shared)
        };
        lock.map(Some).ok_or(InvariantViolation::HostViewHeld)
    }

    /// Stages pending host writes for the submission holding `lock`.
    pub(crate) fn upload_locked(&self, lock: &HostLock<'_>, queue: &wgpu::Queue) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            queue.write_buffer(&self.raw, 0, lock.bytes());
        }
    }

    /// Called under the submit lock before the buffer's commands are encoded.
    pub(crate) fn mark_submitted(&self, writes: bool) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if writes {
            self.pending_writes.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Releases the marks taken by [`Self::mark_submitted`].
    pub(crate) fn retire(&self, writes: bool) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if writes {
            self.pending_writes.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Replaces the host copy with bytes read back from the device.
    ///
    /// Runs while the write is still pending, so no host view can be open.
    pub(crate) fn store_readback(&self, bytes: &[u8]) {
        if let Some(shadow) = &self.shadow {
            let mut shadow = shadow.write();
            let len = shadow.len().min(bytes.len());
            shadow[..len].copy_from_slice(&bytes[..len]);
        }
    }
}

/// A device allocation.
///
/// Single owner: buffers are not `Clone`, and [`Buffer::release`] consumes
/// the handle so a second release does not compile.
pub struct Buffer {
    pub(crate) shared: Arc<BufferShared>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("length", &self.shared.length)
            .field("options", &self.shared.options)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Buffer {
    /// Length in bytes.
    pub fn length(&self) -> u64 {
        self.shared.length
    }

    /// Allocation options.
    pub fn options(&self) -> ResourceOptions {
        self.shared.options
    }

    /// Storage mode.
    pub fn storage_mode(&self) -> StorageMode {
        self.shared.options.storage_mode()
    }

    /// Number of committed, not yet completed command buffers using this buffer.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn shadow(&self) -> Result<&RwLock<Vec<u8>>> {
        let shadow = self
            .shared
            .shadow
            .as_ref()
            .ok_or(ValidationFailure::NotHostVisible)?;
        let pending = self.shared.pending_writes.load(Ordering::Acquire);
        if pending > 0 {
            return Err(InvariantViolation::BufferInFlight { in_flight: pending }.into());
        }
        Ok(shadow)
    }

    /// Read view of the contents.
    ///
    /// Fails for private buffers, while committed work that writes this
    /// buffer has not completed, and while a write view is open.
    pub fn contents(&self) -> Result<BufferContents<'_>> {
        let guard = self
            .shadow()?
            .try_read()
            .ok_or(InvariantViolation::HostViewHeld)?;
        Ok(BufferContents {
            guard,
            len: self.shared.length as usize,
        })
    }

    /// Write view of the contents. Changes reach the device at the next
    /// commit that uses this buffer.
    ///
    /// Same restrictions as [`Buffer::contents`], and fails while any other
    /// view is open. Drop it before committing work that uses the buffer.
    pub fn contents_mut(&self) -> Result<BufferContentsMut<'_>> {
        let guard = self
            .shadow()?
            .try_write()
            .ok_or(InvariantViolation::HostViewHeld)?;
        self.shared.dirty.store(true, Ordering::Release);
        Ok(BufferContentsMut {
            guard,
            len: self.shared.length as usize,
        })
    }

    /// Copies the contents out as `T` values.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        check_element_size::<T>(self.shared.length)?;
        let contents = self.contents()?;
        Ok(bytemuck::pod_collect_to_vec(&contents[..]))
    }

    /// Overwrites the start of the buffer with `values`.
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        if bytes.len() as u64 > self.shared.length {
            return Err(ValidationFailure::LengthMismatch {
                length: self.shared.length,
                provided: bytes.len() as u64,
            }
            .into());
        }
        self.contents_mut()?[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Releases the allocation.
    ///
    /// Fails while committed work still references the buffer; that work
    /// keeps the allocation alive until it completes.
    pub fn release(self) -> Result<()> {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            return Err(InvariantViolation::BufferInFlight { in_flight }.into());
        }
        debug!(length = self.shared.length, "buffer released");
        Ok(())
    }
}

fn check_element_size<T>(length: u64) -> Result<(), ValidationFailure> {
    let element_size = std::mem::size_of::<T>();
    if element_size == 0 || length % element_size as u64 != 0 {
        return Err(ValidationFailure::ElementSizeMismatch {
            length,
            element_size,
        });
    }
    Ok(())
}

/// Read-only host view of a buffer.
#[derive(Debug)]
pub struct BufferContents<'a> {
    guard: RwLockReadGuard<'a, Vec<u8>>,
    len: usize,
}

impl Deref for BufferContents<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

/// Writable host view of a buffer.
#[derive(Debug)]
pub struct BufferContentsMut<'a> {
    guard: RwLockWriteGuard<'a, Vec<u8>>,
    len: usize,
}

impl Deref for BufferContentsMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

impl DerefMut for BufferContentsMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..self.len]
    }
}

fn check_allocation(
    bytes: Option<&[u8]>,
    length: u64,
    options: ResourceOptions,
) -> Result<ResourceOptions, ValidationFailure> {
    let options = options.validate()?;
    if options.storage_mode() == StorageMode::Memoryless {
        return Err(ValidationFailure::MemorylessBuffer);
    }
    if length == 0 {
        return Err(ValidationFailure::ZeroLength);
    }
    if let Some(bytes) = bytes
        && bytes.len() as u64 != length
    {
        return Err(ValidationFailure::LengthMismatch {
            length,
            provided: bytes.len() as u64,
        });
    }
    Ok(options)
}

impl Device {
    /// Allocates a buffer of `length` bytes, initialized from `bytes` when
    /// given and zero-filled otherwise.
    pub fn make_buffer(
        &self,
        bytes: Option<&[u8]>,
        length: u64,
        options: ResourceOptions,
    ) -> Result<Buffer> {
        let options = check_allocation(bytes, length, options)?;

        let padded = length.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::UNIFORM
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let initial = bytes.map(|bytes| {
            let mut data = bytes.to_vec();
            data.resize(padded as usize, 0);
            data
        });

        let (raw, errors) = self.capture_errors(|| match &initial {
            Some(data) => self
                .raw()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("compute buffer"),
                    contents: data,
                    usage,
                }),
            None => self.raw().create_buffer(&wgpu::BufferDescriptor {
                label: Some("compute buffer"),
                size: padded,
                usage,
                mapped_at_creation: false,
            }),
        });
        if let Some(err) = CapturedError::into_execution(errors) {
            return Err(Error::Execution(err));
        }

        let shadow = options
            .storage_mode()
            .is_host_visible()
            .then(|| RwLock::new(initial.unwrap_or_else(|| vec![0; padded as usize])));
        debug!(length, options = ?options, "buffer allocated");

        Ok(Buffer {
            shared: Arc::new(BufferShared {
                device_id: self.id(),
                raw,
                length,
                options,
                shadow,
                dirty: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                pending_writes: AtomicUsize::new(0),
            }),
        })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn make_buffer_with_data<T: Pod>(
        &self,
        data: &[T],
        options: ResourceOptions,
    ) -> Result<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.make_buffer(Some(bytes), bytes.len() as u64, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CpuCacheMode, HazardTrackingMode};

    #[test]
    fn allocation_checks() {
        let shared = ResourceOptions::default();
        assert_eq!(
            check_allocation(None, 0, shared),
            Err(ValidationFailure::ZeroLength)
        );
        assert_eq!(
            check_allocation(Some(&[1, 2, 3]), 4, shared),
            Err(ValidationFailure::LengthMismatch {
                length: 4,
                provided: 3
            })
        );
        assert_eq!(
            check_allocation(None, 16, StorageMode::Memoryless.into()),
            Err(ValidationFailure::MemorylessBuffer)
        );
        assert_eq!(
            check_allocation(None, 16, ResourceOptions::from_bits_retain(0x1000)),
            Err(ValidationFailure::UnknownResourceOptions { bits: 0x1000 })
        );
        let options = ResourceOptions::new(
            StorageMode::Managed,
            CpuCacheMode::WriteCombined,
            HazardTrackingMode::Untracked,
        );
        assert_eq!(check_allocation(Some(&[0; 8]), 8, options), Ok(options));
    }

    #[test]
    fn element_size_must_divide_length() {
        assert!(check_element_size::<f32>(16).is_ok());
        assert_eq!(
            check_element_size::<f32>(10),
            Err(ValidationFailure::ElementSizeMismatch {
                length: 10,
                element_size: 4
            })
        );
    }

    #[test]
    fn host_visible_buffer_reads_back_its_bytes() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let bytes = [9u8, 8, 7, 6, 5];
        let buffer = device
            .make_buffer(Some(&bytes), 5, ResourceOptions::default())
            .unwrap();
        assert_eq!(&*buffer.contents().unwrap(), &bytes);
        assert_eq!(buffer.length(), 5);

        buffer.contents_mut().unwrap()[0] = 1;
        assert_eq!(buffer.contents().unwrap()[0], 1);
        buffer.release().unwrap();
    }

    #[test]
    fn conflicting_views_fail_instead_of_blocking() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let buffer = device
            .make_buffer_with_data(&[1u32, 2], ResourceOptions::default())
            .unwrap();
        let first = buffer.contents().unwrap();
        let second = buffer.contents().unwrap();
        assert_eq!(&first[..], &second[..]);
        assert!(matches!(
            buffer.contents_mut(),
            Err(Error::Invariant(InvariantViolation::HostViewHeld))
        ));
        drop((first, second));

        let mut view = buffer.contents_mut().unwrap();
        view[..4].copy_from_slice(&7u32.to_ne_bytes());
        assert!(matches!(
            buffer.read::<u32>(),
            Err(Error::Invariant(InvariantViolation::HostViewHeld))
        ));
        drop(view);
        assert_eq!(buffer.read::<u32>().unwrap(), [7, 2]);
    }

    #[test]
    fn zero_filled_and_typed_access() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let buffer = device
            .make_buffer(None, 16, StorageMode::Managed.into())
            .unwrap();
        assert_eq!(buffer.read::<u32>().unwrap(), vec![0; 4]);
        buffer.write(&[1.5f32, 2.5]).unwrap();
        assert_eq!(
            buffer.read::<f32>().unwrap(),
            vec![1.5, 2.5, 0.0, 0.0]
        );
        assert!(matches!(
            buffer.write(&[0u32; 5]),
            Err(Error::Validation(ValidationFailure::LengthMismatch { .. }))
        ));
    }

    #[test]
    fn private_buffers_have_no_host_view() {
        let Some(device) = crate::test_util::device_or_skip() else {
            return;
        };
        let buffer = device
            .make_buffer_with_data(&[1u32, 2, 3], StorageMode::Private.into())
            .unwrap();
        assert_eq!(buffer.length(), 12);
        assert!(matches!(
            buffer.contents(),
            Err(Error::Validation(ValidationFailure::NotHostVisible))
        ));
    }
}
