//! Command buffers: the unit of submitted work.
//!
//! # Lifecycle
//!
//! ```text
//! Recording --commit--> Committed --worker retires--> Completed
//!     |
//!     +--discard--> (gone)
//! ```
//!
//! While `Recording`, at most one [`ComputeCommandEncoder`] is open; it must be
//! ended before [`CommandBuffer::commit`]. Commit is non-blocking: it uploads
//! dirty host copies, lowers the recorded passes into native commands,
//! submits them and hands the submission to the device's completion worker.
//! The worker moves the buffer to `Completed` by resolving its
//! [`CompletionSignal`].
//!
//! # Errors
//!
//! Ordering mistakes fail synchronously with an
//! [`InvariantViolation`](crate::InvariantViolation). Native errors raised
//! while encoding or submitting never fail `commit`; they become the
//! completion status, as do device loss and readback failures.

use std::{
    fmt, mem,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use rustc_hash::FxHashMap;
use tracing::{info_span, trace, warn};
use wgpu::util::DeviceExt;

use crate::{
    buffer::BufferShared,
    completion::{CompletionSignal, CompletionStatus},
    device::{CapturedError, Device},
    encoder::{Argument, ComputeCommandEncoder, RecordedPass},
    error::{ExecutionError, InvariantViolation, Result},
    pipeline::ArgumentKind,
    submission::{Readback, Retirement},
};

/// Inline argument buffers are padded to this many bytes.
const INLINE_ALIGNMENT: usize = 16;

/// Observable state of a [`CommandBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Accepting encoders.
    Recording,
    /// Submitted, not yet finished.
    Committed,
    /// Finished, successfully or not.
    Completed,
}

/// A bound argument resolved to a native buffer for one dispatch.
enum Bound<'a> {
    Shared(&'a BufferShared, u64),
    Inline(wgpu::Buffer, u64),
}

/// A buffer touched by a submission and whether any dispatch writes it.
pub(crate) type TouchedBuffer = (Arc<BufferShared>, bool);

/// An ordered list of compute passes, submitted once.
pub struct CommandBuffer {
    device: Device,
    label: Option<String>,
    outstanding: Arc<AtomicUsize>,
    committed: bool,
    encoder_open: bool,
    passes: Vec<RecordedPass>,
    signal: CompletionSignal,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("encoder_open", &self.encoder_open)
            .field("passes", &self.passes.len())
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(device: Device, label: Option<String>, outstanding: Arc<AtomicUsize>) -> Self {
        Self {
            device,
            label,
            outstanding,
            committed: false,
            encoder_open: false,
            passes: Vec::new(),
            signal: CompletionSignal::new(),
        }
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    /// Current state.
    pub fn state(&self) -> CommandBufferState {
        if !self.committed {
            CommandBufferState::Recording
        } else if self.signal.is_completed() {
            CommandBufferState::Completed
        } else {
            CommandBufferState::Committed
        }
    }

    /// Debug label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Sets the debug label used for native commands.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    fn ensure_recording(&self) -> Result<()> {
        match self.state() {
            CommandBufferState::Recording => Ok(()),
            state => Err(InvariantViolation::NotRecording { state }.into()),
        }
    }

    /// Opens a compute encoder.
    pub fn make_compute_command_encoder(&mut self) -> Result<ComputeCommandEncoder<'_>> {
        self.ensure_recording()?;
        if self.encoder_open {
            return Err(InvariantViolation::EncoderAlreadyOpen.into());
        }
        self.encoder_open = true;
        Ok(ComputeCommandEncoder::new(self))
    }

    pub(crate) fn finish_pass(&mut self, pass: RecordedPass) {
        self.encoder_open = false;
        if !pass.dispatches.is_empty() {
            self.passes.push(pass);
        }
    }

    /// Registers a handler invoked exactly once when this buffer completes,
    /// whatever the outcome. Only allowed before commit.
    pub fn add_completed_handler(
        &mut self,
        handler: impl FnOnce(&CompletionStatus) + Send + 'static,
    ) -> Result<()> {
        self.ensure_recording()?;
        self.signal.on_completed(handler);
        Ok(())
    }

    /// Handle to this buffer's completion, usable from other threads.
    pub fn completion(&self) -> CompletionSignal {
        self.signal.clone()
    }

    /// Completion status, once completed.
    pub fn status(&self) -> Option<CompletionStatus> {
        self.signal.status()
    }

    /// Submits the recorded work. Does not wait for the device.
    ///
    /// Fails with [`InvariantViolation::HostViewHeld`] when a host view
    /// conflicts with the submission; the buffer then stays `Recording`.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if self.encoder_open {
            return Err(InvariantViolation::EncoderNotEnded.into());
        }
        let span = info_span!("commit", label = ?self.label, passes = self.passes.len());
        let _enter = span.enter();

        match self.device.lost_reason() {
            Some(message) => {
                self.committed = true;
                self.passes.clear();
                self.device.worker().send(Retirement {
                    submission: None,
                    readbacks: Vec::new(),
                    touched: Vec::new(),
                    failure: Some(ExecutionError::DeviceLost { message }),
                    signal: self.signal.clone(),
                    outstanding: self.outstanding.clone(),
                });
            }
            None => self.submit()?,
        }
        trace!("committed");
        Ok(())
    }

    /// Uploads, lowers and submits under the device's submit lock, then
    /// queues the retirement before releasing it.
    fn submit(&mut self) -> Result<()> {
        let device = self.device.clone();
        let _order = device.lock_submissions();

        let touched = touched_buffers(&self.passes);
        let host = touched
            .iter()
            .map(|(buffer, writes)| buffer.try_lock_host(*writes))
            .collect::<Result<Vec<_>, _>>()?;

        self.committed = true;
        let passes = mem::take(&mut self.passes);
        for (buffer, writes) in &touched {
            buffer.mark_submitted(*writes);
        }

        let ((submission, readbacks), errors) = device.capture_errors(|| {
            for ((buffer, _), lock) in touched.iter().zip(&host) {
                if let Some(lock) = lock {
                    buffer.upload_locked(lock, device.queue());
                }
            }
            let (commands, readbacks) = self.lower(&passes, &touched);
            (device.queue().submit(Some(commands)), readbacks)
        });
        drop(host);

        device.worker().send(Retirement {
            submission: Some(submission),
            readbacks,
            touched,
            failure: CapturedError::into_execution(errors),
            signal: self.signal.clone(),
            outstanding: self.outstanding.clone(),
        });
        Ok(())
    }

    fn lower(
        &self,
        passes: &[RecordedPass],
        touched: &[TouchedBuffer],
    ) -> (wgpu::CommandBuffer, Vec<Readback>) {
        let device = self.device.raw();
        let label = self.label.as_deref();
        let max_uniform = u64::from(self.device.limits().max_uniform_buffer_binding_size);
        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label });

        for pass in passes {
            let mut compute = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label,
                timestamp_writes: None,
            });
            for dispatch in &pass.dispatches {
                let slots = dispatch.pipeline.argument_slots();
                let bound: Vec<Bound<'_>> = dispatch
                    .arguments
                    .iter()
                    .map(|argument| match argument {
                        Argument::Buffer { buffer, offset } => Bound::Shared(buffer, *offset),
                        Argument::Bytes(bytes) => {
                            Bound::Inline(inline_buffer(device, bytes), bytes.len() as u64)
                        }
                    })
                    .collect();
                let entries: Vec<wgpu::BindGroupEntry<'_>> = slots
                    .iter()
                    .zip(&bound)
                    .map(|(slot, bound)| {
                        let (buffer, offset, available) = match bound {
                            Bound::Shared(buffer, offset) => {
                                (&buffer.raw, *offset, buffer.length - offset)
                            }
                            Bound::Inline(raw, len) => (raw, 0, *len),
                        };
                        let size = match slot.kind {
                            ArgumentKind::Uniform => NonZeroU64::new(available.min(max_uniform)),
                            ArgumentKind::Storage { .. } => None,
                        };
                        wgpu::BindGroupEntry {
                            binding: slot.index,
                            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                                buffer,
                                offset,
                                size,
                            }),
                        }
                    })
                    .collect();
                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(dispatch.pipeline.function_name()),
                    layout: dispatch.pipeline.bind_group_layout(),
                    entries: &entries,
                });

                compute.set_pipeline(&dispatch.raw);
                compute.set_bind_group(0, &bind_group, &[]);
                let [x, y, z] = dispatch.groups;
                compute.dispatch_workgroups(x, y, z);
            }
        }

        let readbacks = touched
            .iter()
            .filter(|(buffer, writes)| *writes && buffer.is_host_visible())
            .map(|(buffer, _)| {
                let size = buffer.raw.size();
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("readback staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(&buffer.raw, 0, &staging, 0, size);
                Readback {
                    staging,
                    target: buffer.clone(),
                }
            })
            .collect();

        (encoder.finish(), readbacks)
    }

    /// Blocks until the device has finished this buffer.
    ///
    /// Returns immediately once completed, and returns the execution error
    /// attached to the buffer, if any.
    pub fn wait_until_completed(&self) -> Result<()> {
        if !self.committed {
            return Err(InvariantViolation::NotCommitted.into());
        }
        self.signal.wait()?;
        Ok(())
    }

    /// Releases a completed command buffer.
    pub fn release(self) -> Result<()> {
        match self.state() {
            CommandBufferState::Completed => Ok(()),
            state => Err(InvariantViolation::ReleasedBeforeCompletion { state }.into()),
        }
    }

    /// Cancels a command buffer that was never committed.
    pub fn discard(self) -> Result<()> {
        self.ensure_recording()?;
        trace!(label = ?self.label, "command buffer discarded");
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if !self.committed {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            if !self.passes.is_empty() {
                warn!(
                    label = ?self.label,
                    passes = self.passes.len(),
                    "command buffer dropped without commit"
                );
            }
        }
    }
}

/// Every buffer the passes reference, deduplicated, with a write flag.
fn touched_buffers(passes: &[RecordedPass]) -> Vec<TouchedBuffer> {
    let mut seen: FxHashMap<*const BufferShared, usize> = FxHashMap::default();
    let mut touched: Vec<TouchedBuffer> = Vec::new();
    for dispatch in passes.iter().flat_map(|pass| &pass.dispatches) {
        for (slot, argument) in dispatch
            .pipeline
            .argument_slots()
            .iter()
            .zip(&dispatch.arguments)
        {
            let Argument::Buffer { buffer, .. } = argument else {
                continue;
            };
            let index = *seen.entry(Arc::as_ptr(buffer)).or_insert_with(|| {
                touched.push((buffer.clone(), false));
                touched.len() - 1
            });
            touched[index].1 |= slot.writes;
        }
    }
    touched
}

fn inline_buffer(device: &wgpu::Device, bytes: &[u8]) -> wgpu::Buffer {
    let mut contents = bytes.to_vec();
    contents.resize(bytes.len().next_multiple_of(INLINE_ALIGNMENT), 0);
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("inline argument"),
        contents: &contents,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::STORAGE,
    })
}
