//! compute-queue is a command-submission layer for GPU compute dispatch.
//!
//! # Pipeline
//!
//! Work flows through a fixed chain of objects:
//!
//! device → library → pipeline state → command queue → command buffer →
//! compute encoder → buffer
//!
//! A [`Device`] compiles WGSL source into a [`Library`], resolves a named
//! [`Function`] and builds a [`ComputePipelineState`] from it. A
//! [`CommandQueue`] hands out [`CommandBuffer`]s; each one records compute
//! passes through a [`ComputeCommandEncoder`], is committed once, and
//! completes asynchronously. [`Buffer`]s are allocated once and reused.
//!
//! ```no_run
//! use compute_queue::{CompileOptions, Device, ResourceOptions, Size3D};
//!
//! # fn main() -> compute_queue::Result<()> {
//! let device = Device::system_default()?;
//! let library = device.make_library(
//!     r#"
//!     @group(0) @binding(0) var<storage, read_write> data: array<f32>;
//!
//!     @compute @workgroup_size(4)
//!     fn double_values(@builtin(global_invocation_id) id: vec3<u32>) {
//!         if (id.x < arrayLength(&data)) {
//!             data[id.x] = data[id.x] * 2.0;
//!         }
//!     }
//!     "#,
//!     &CompileOptions::default(),
//! )?;
//! let pipeline = device.make_compute_pipeline_state(&library.make_function("double_values")?)?;
//! let data = device.make_buffer_with_data(&[1.0f32, 2.0, 3.0, 4.0], ResourceOptions::default())?;
//!
//! let queue = device.make_command_queue();
//! let mut command_buffer = queue.make_command_buffer();
//! let mut encoder = command_buffer.make_compute_command_encoder()?;
//! encoder.set_compute_pipeline_state(&pipeline)?;
//! encoder.set_buffer(&data, 0, 0)?;
//! encoder.dispatch_threads(Size3D::linear(4), Size3D::linear(4))?;
//! encoder.end_encoding();
//!
//! command_buffer.commit()?;
//! command_buffer.wait_until_completed()?;
//! assert_eq!(data.read::<f32>()?, [2.0, 4.0, 6.0, 8.0]);
//! # Ok(())
//! # }
//! ```
//!
//! # Ordering rules
//!
//! One encoder may be open per command buffer, and it must be ended before
//! commit. Command buffers committed to one queue from one thread execute in
//! commit order. Breaking an ordering rule returns an
//! [`InvariantViolation`]; a bad argument returns a [`ValidationFailure`].
//! Failures on the device are reported only through the command buffer's
//! completion status.
//!
//! # Logging
//!
//! Events are emitted with `tracing`. Call [`logging::init_tracing`] to
//! install a subscriber filtered by `RUST_LOG`.

#![deny(missing_docs, clippy::unwrap_used)]

mod buffer;
mod command_buffer;
mod completion;
pub mod config;
mod device;
mod encoder;
mod error;
mod library;
pub mod logging;
mod options;
mod pipeline;
mod queue;
mod reflect;
mod size;
mod submission;

pub use wgpu;

pub use crate::{
    buffer::{Buffer, BufferContents, BufferContentsMut},
    command_buffer::{CommandBuffer, CommandBufferState},
    completion::{CompletionSignal, CompletionStatus},
    config::{Backend, ComputeConfig, DeviceOptions, PowerPreference},
    device::{Device, DeviceInfo, is_available},
    encoder::{ComputeCommandEncoder, MAX_ARGUMENT_SLOTS, MAX_INLINE_BYTES},
    error::{
        Error, ErrorKind, ExecutionError, InvariantViolation, Result, ValidationFailure,
    },
    library::{CompileOptions, Function, LanguageVersion, Library},
    options::{CpuCacheMode, HazardTrackingMode, ResourceOptions, StorageMode},
    pipeline::{ArgumentKind, ArgumentSlot, ComputePipelineState, DispatchLayout},
    reflect::FunctionStage,
    size::Size3D,
};
