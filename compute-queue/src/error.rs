//! Error taxonomy for the submission pipeline.
//!
//! Every fallible operation returns [`Result`]. The variants are grouped into
//! categories ([`ErrorKind`]) so callers can tell a recoverable mistake (bad
//! slot index, missing function) from a broken state-machine invariant
//! (committing twice, releasing a buffer that is still in flight).

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No usable compute device.
    Selection,
    /// Shader compilation or pipeline construction failed.
    Compile,
    /// A named entry point does not exist.
    Lookup,
    /// A recoverable caller error detected at bind, dispatch or allocation time.
    Validation,
    /// A state-machine misuse; the caller broke an ordering rule.
    Invariant,
    /// The device failed while executing submitted work.
    Execution,
    /// Configuration could not be read or parsed.
    Config,
}

/// Errors returned by the submission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No adapter matched the selection policy.
    #[error("no compute device found: {reason}")]
    NoDeviceFound {
        /// Why selection failed.
        reason: String,
    },
    /// Kernel source did not compile.
    #[error("shader compilation failed:\n{diagnostic}")]
    Compile {
        /// Human-readable diagnostic, annotated with source locations when available.
        diagnostic: String,
    },
    /// A function could not be lowered into a compute pipeline.
    #[error("compute pipeline build failed: {diagnostic}")]
    PipelineBuild {
        /// Human-readable diagnostic.
        diagnostic: String,
    },
    /// The library has no entry point with this exact name.
    #[error("function {name:?} not found")]
    FunctionNotFound {
        /// The name that was looked up.
        name: String,
    },
    /// See [`ValidationFailure`].
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    /// See [`InvariantViolation`].
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// See [`ExecutionError`].
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// A configuration source could not be loaded.
    #[error("invalid configuration: {message}")]
    Config {
        /// Parser or I/O message.
        message: String,
    },
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoDeviceFound { .. } => ErrorKind::Selection,
            Self::Compile { .. } | Self::PipelineBuild { .. } => ErrorKind::Compile,
            Self::FunctionNotFound { .. } => ErrorKind::Lookup,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Whether the caller may fix the input and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Compile | ErrorKind::Lookup | ErrorKind::Validation | ErrorKind::Config
        )
    }
}

/// Recoverable caller errors, reported synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// `dispatch_threads` was called before a pipeline state was bound.
    #[error("no compute pipeline state bound before dispatch")]
    NoPipelineBound,
    /// An argument slot index is outside the argument table.
    #[error("argument index {index} out of range (max {max})")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of available slots.
        max: usize,
    },
    /// A grid or group shape has a zero dimension.
    #[error("{what} has a zero dimension: {width}x{height}x{depth}")]
    EmptyDimension {
        /// Which shape was rejected.
        what: &'static str,
        /// Width.
        width: u32,
        /// Height.
        height: u32,
        /// Depth.
        depth: u32,
    },
    /// The group shape does not match the kernel's declared workgroup size.
    #[error(
        "threadgroup size {got:?} does not match the workgroup size {expected:?} declared by `{function}`"
    )]
    ThreadgroupSizeMismatch {
        /// Kernel name.
        function: String,
        /// Declared size.
        expected: [u32; 3],
        /// Requested size.
        got: [u32; 3],
    },
    /// The requested group shape exceeds the device's workgroup limits.
    #[error(
        "threadgroup size {got:?} exceeds device limits (per axis {max:?}, {max_invocations} invocations)"
    )]
    ThreadgroupTooLarge {
        /// Requested size.
        got: [u32; 3],
        /// Per-axis maximum.
        max: [u32; 3],
        /// Maximum invocations per group.
        max_invocations: u32,
    },
    /// The grid needs more workgroups than the device allows.
    #[error("grid needs {groups} workgroups along axis {axis}, device limit is {limit}")]
    GridTooLarge {
        /// Axis index (0 = x).
        axis: usize,
        /// Required workgroup count.
        groups: u32,
        /// Device limit.
        limit: u32,
    },
    /// A slot the kernel reads or writes has no argument bound.
    #[error("argument slot {index} used by `{function}` is not bound")]
    UnboundArgument {
        /// Kernel name.
        function: String,
        /// Slot index.
        index: u32,
    },
    /// Inline bytes were bound to a slot the kernel writes.
    #[error("argument slot {index} is written by the kernel and needs a buffer, not inline bytes")]
    InlineBytesForWritableSlot {
        /// Slot index.
        index: u32,
    },
    /// The bound argument is smaller than the kernel's binding type.
    #[error("argument slot {index} provides {available} bytes, kernel needs at least {required}")]
    ArgumentTooSmall {
        /// Slot index.
        index: u32,
        /// Bytes visible through the binding.
        available: u64,
        /// Minimum binding size of the kernel's type.
        required: u64,
    },
    /// Inline bytes were empty.
    #[error("inline argument bytes are empty")]
    EmptyBytes,
    /// Inline bytes exceed the inline argument limit.
    #[error("inline argument of {len} bytes exceeds the {max} byte limit; use a buffer")]
    BytesTooLarge {
        /// Provided length.
        len: usize,
        /// Limit.
        max: usize,
    },
    /// A buffer offset points past the end of the buffer.
    #[error("offset {offset} is outside a buffer of {length} bytes")]
    OffsetOutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Buffer length.
        length: u64,
    },
    /// A buffer offset breaks the device's binding alignment.
    #[error("offset {offset} is not a multiple of the required alignment {alignment}")]
    MisalignedOffset {
        /// Requested offset.
        offset: u64,
        /// Required alignment.
        alignment: u64,
    },
    /// Resource options carry bits this layer does not understand.
    #[error("unknown resource option bits {bits:#06x}")]
    UnknownResourceOptions {
        /// The unrecognized bits.
        bits: u16,
    },
    /// Memoryless storage only applies to transient render targets.
    #[error("memoryless storage is not valid for buffers")]
    MemorylessBuffer,
    /// Buffers must have a non-zero length.
    #[error("buffer length must be greater than zero")]
    ZeroLength,
    /// Initial bytes and requested length disagree.
    #[error("initial data has {provided} bytes but length {length} was requested")]
    LengthMismatch {
        /// Requested length.
        length: u64,
        /// Bytes provided.
        provided: u64,
    },
    /// Typed access does not divide the buffer evenly.
    #[error("buffer of {length} bytes is not a whole number of {element_size}-byte elements")]
    ElementSizeMismatch {
        /// Buffer length.
        length: u64,
        /// Element size.
        element_size: usize,
    },
    /// The buffer lives in device-private memory.
    #[error("buffer storage is private to the device and has no host view")]
    NotHostVisible,
    /// Objects from two different devices were combined.
    #[error("{what} belongs to a different device")]
    DeviceMismatch {
        /// Which object was rejected.
        what: &'static str,
    },
}

/// State-machine misuse. These signal a programming error in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// An encoder is already open on this command buffer.
    #[error("a compute encoder is already open on this command buffer")]
    EncoderAlreadyOpen,
    /// Commit was attempted while an encoder was still open.
    #[error("the open compute encoder must be ended before commit")]
    EncoderNotEnded,
    /// The operation needs the command buffer to be recording.
    #[error("command buffer is {state:?}, expected Recording")]
    NotRecording {
        /// Actual state.
        state: crate::CommandBufferState,
    },
    /// Waiting on a command buffer that was never committed.
    #[error("command buffer was never committed")]
    NotCommitted,
    /// Release was attempted before completion.
    #[error("command buffer released while {state:?}")]
    ReleasedBeforeCompletion {
        /// Actual state.
        state: crate::CommandBufferState,
    },
    /// A buffer was released or viewed while submitted work still uses it.
    #[error("buffer is still referenced by {in_flight} in-flight command buffer(s)")]
    BufferInFlight {
        /// Number of in-flight command buffers.
        in_flight: usize,
    },
    /// A host view conflicts with the requested access: a write view is open,
    /// or a commit needs exclusive access to a buffer that has a view open.
    #[error("a host view of the buffer is still open")]
    HostViewHeld,
    /// A queue was released while its command buffers were outstanding.
    #[error("command queue released with {pending} outstanding command buffer(s)")]
    QueueHasPendingWork {
        /// Outstanding command buffers.
        pending: usize,
    },
}

/// Device-side failures, delivered through the completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The native layer rejected the submitted commands.
    #[error("submission rejected by the device: {message}")]
    Rejected {
        /// Native validation message.
        message: String,
    },
    /// The device ran out of memory while executing.
    #[error("device out of memory: {message}")]
    OutOfMemory {
        /// Native message.
        message: String,
    },
    /// The device was lost.
    #[error("device lost: {message}")]
    DeviceLost {
        /// Native message.
        message: String,
    },
    /// Results could not be copied back to host-visible memory.
    #[error("readback failed: {message}")]
    Readback {
        /// Native message.
        message: String,
    },
}
