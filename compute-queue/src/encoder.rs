//! Compute command encoding.
//!
//! An encoder mutably borrows its command buffer, binds a pipeline state and
//! arguments, and records dispatches. Every dispatch is validated against the
//! bound pipeline's [`DispatchLayout`] and snapshots the argument table, so a
//! later rebind does not affect dispatches already recorded. A dispatch that
//! fails validation records nothing.

use std::sync::Arc;

use bytemuck::Pod;
use smallvec::SmallVec;
use tracing::trace;

use crate::{
    buffer::{Buffer, BufferShared},
    command_buffer::CommandBuffer,
    error::{Result, ValidationFailure},
    pipeline::{ComputePipelineState, DispatchLayout},
    size::Size3D,
};

/// Number of argument slots per encoder.
pub const MAX_ARGUMENT_SLOTS: usize = 31;

/// Largest inline argument accepted by [`ComputeCommandEncoder::set_bytes`].
pub const MAX_INLINE_BYTES: usize = 4096;

/// A value bound to an argument slot.
#[derive(Clone)]
pub(crate) enum Argument {
    Buffer {
        buffer: Arc<BufferShared>,
        offset: u64,
    },
    Bytes(Arc<[u8]>),
}

impl Argument {
    fn is_inline(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    /// Bytes visible to the kernel through this binding.
    fn available(&self) -> u64 {
        match self {
            Self::Buffer { buffer, offset } => buffer.length - offset,
            Self::Bytes(bytes) => bytes.len() as u64,
        }
    }
}

/// Arguments snapshotted for one dispatch, in the layout's slot order.
pub(crate) type DispatchArguments = SmallVec<[Argument; 4]>;

pub(crate) struct RecordedDispatch {
    pub(crate) pipeline: ComputePipelineState,
    /// Native pipeline for this dispatch's group shape.
    pub(crate) raw: wgpu::ComputePipeline,
    pub(crate) arguments: DispatchArguments,
    pub(crate) groups: [u32; 3],
}

pub(crate) struct RecordedPass {
    pub(crate) dispatches: Vec<RecordedDispatch>,
}

fn check_index(index: usize) -> Result<(), ValidationFailure> {
    if index >= MAX_ARGUMENT_SLOTS {
        return Err(ValidationFailure::IndexOutOfRange {
            index,
            max: MAX_ARGUMENT_SLOTS,
        });
    }
    Ok(())
}

fn check_inline_bytes(bytes: &[u8]) -> Result<(), ValidationFailure> {
    if bytes.is_empty() {
        return Err(ValidationFailure::EmptyBytes);
    }
    if bytes.len() > MAX_INLINE_BYTES {
        return Err(ValidationFailure::BytesTooLarge {
            len: bytes.len(),
            max: MAX_INLINE_BYTES,
        });
    }
    Ok(())
}

fn check_offset(offset: u64, length: u64, alignment: u64) -> Result<(), ValidationFailure> {
    if offset >= length {
        return Err(ValidationFailure::OffsetOutOfBounds { offset, length });
    }
    if offset % alignment != 0 {
        return Err(ValidationFailure::MisalignedOffset { offset, alignment });
    }
    Ok(())
}

/// Argument slots of one encoder. Rebinding a slot replaces the previous value.
pub(crate) struct ArgumentTable {
    slots: [Option<Argument>; MAX_ARGUMENT_SLOTS],
}

impl Default for ArgumentTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl ArgumentTable {
    fn bind(&mut self, index: usize, argument: Argument) -> Result<(), ValidationFailure> {
        check_index(index)?;
        self.slots[index] = Some(argument);
        Ok(())
    }

    fn bind_bytes(&mut self, index: usize, bytes: &[u8]) -> Result<(), ValidationFailure> {
        check_index(index)?;
        check_inline_bytes(bytes)?;
        self.bind(index, Argument::Bytes(Arc::from(bytes)))
    }
}

/// Device limits a dispatch is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchLimits {
    pub(crate) max_groups_per_dimension: u32,
    pub(crate) max_group_size: [u32; 3],
    pub(crate) max_invocations_per_group: u32,
}

impl From<&wgpu::Limits> for DispatchLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        Self {
            max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_group_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_invocations_per_group: limits.max_compute_invocations_per_workgroup,
        }
    }
}

/// Literal axes must match the declaration. Override axes accept any size,
/// but axes sharing one override must agree.
fn check_group_shape(layout: &DispatchLayout, group: Size3D) -> Result<(), ValidationFailure> {
    let declared = layout.workgroup_size().to_array();
    let got = group.to_array();
    let mismatch = || ValidationFailure::ThreadgroupSizeMismatch {
        function: layout.function().to_string(),
        expected: declared,
        got,
    };
    for axis in 0..3 {
        match layout.axis_override(axis) {
            None if got[axis] != declared[axis] => return Err(mismatch()),
            None => {}
            Some(key) => {
                let conflict = (0..axis)
                    .any(|other| layout.axis_override(other) == Some(key) && got[other] != got[axis]);
                if conflict {
                    return Err(mismatch());
                }
            }
        }
    }
    Ok(())
}

/// Checks a dispatch against the bound layout and snapshots its arguments.
///
/// Returns the workgroup count per axis along with the arguments.
pub(crate) fn plan_dispatch(
    layout: Option<&DispatchLayout>,
    table: &ArgumentTable,
    threads_per_grid: Size3D,
    threads_per_threadgroup: Size3D,
    limits: DispatchLimits,
) -> Result<([u32; 3], DispatchArguments), ValidationFailure> {
    let layout = layout.ok_or(ValidationFailure::NoPipelineBound)?;
    threads_per_grid.ensure_non_empty("threads per grid")?;
    threads_per_threadgroup.ensure_non_empty("threads per threadgroup")?;

    check_group_shape(layout, threads_per_threadgroup)?;
    let group = threads_per_threadgroup.to_array();
    let over_axis = group
        .iter()
        .zip(limits.max_group_size)
        .any(|(&got, max)| got > max);
    if over_axis || threads_per_threadgroup.volume() > u64::from(limits.max_invocations_per_group)
    {
        return Err(ValidationFailure::ThreadgroupTooLarge {
            got: group,
            max: limits.max_group_size,
            max_invocations: limits.max_invocations_per_group,
        });
    }

    let groups = threads_per_grid.groups_to_cover(threads_per_threadgroup);
    if let Some((axis, &groups)) = groups
        .iter()
        .enumerate()
        .find(|(_, groups)| **groups > limits.max_groups_per_dimension)
    {
        return Err(ValidationFailure::GridTooLarge {
            axis,
            groups,
            limit: limits.max_groups_per_dimension,
        });
    }

    let mut arguments = DispatchArguments::with_capacity(layout.slots().len());
    for slot in layout.slots() {
        let argument = table.slots[slot.index as usize].as_ref().ok_or_else(|| {
            ValidationFailure::UnboundArgument {
                function: layout.function().to_string(),
                index: slot.index,
            }
        })?;
        if slot.writes && argument.is_inline() {
            return Err(ValidationFailure::InlineBytesForWritableSlot { index: slot.index });
        }
        let available = argument.available();
        if available < slot.min_size {
            return Err(ValidationFailure::ArgumentTooSmall {
                index: slot.index,
                available,
                required: slot.min_size,
            });
        }
        arguments.push(argument.clone());
    }

    Ok((groups, arguments))
}

/// Records compute dispatches into a command buffer.
///
/// Obtained from [`CommandBuffer::make_compute_command_encoder`]. Finish with
/// [`ComputeCommandEncoder::end_encoding`]; dropping the encoder instead
/// discards its dispatches and leaves the command buffer unable to commit.
pub struct ComputeCommandEncoder<'cb> {
    command_buffer: &'cb mut CommandBuffer,
    pipeline: Option<ComputePipelineState>,
    arguments: ArgumentTable,
    dispatches: Vec<RecordedDispatch>,
}

impl<'cb> ComputeCommandEncoder<'cb> {
    pub(crate) fn new(command_buffer: &'cb mut CommandBuffer) -> Self {
        Self {
            command_buffer,
            pipeline: None,
            arguments: ArgumentTable::default(),
            dispatches: Vec::new(),
        }
    }

    /// Binds the pipeline used by subsequent dispatches.
    pub fn set_compute_pipeline_state(&mut self, state: &ComputePipelineState) -> Result<()> {
        if state.device_id() != self.command_buffer.device().id() {
            return Err(ValidationFailure::DeviceMismatch {
                what: "compute pipeline state",
            }
            .into());
        }
        self.pipeline = Some(state.clone());
        Ok(())
    }

    /// Binds a copy of `bytes` to slot `index`.
    pub fn set_bytes(&mut self, bytes: &[u8], index: usize) -> Result<()> {
        self.arguments.bind_bytes(index, bytes)?;
        Ok(())
    }

    /// Binds the bytes of `value` to slot `index`.
    pub fn set_value<T: Pod>(&mut self, value: &T, index: usize) -> Result<()> {
        self.set_bytes(bytemuck::bytes_of(value), index)
    }

    /// Binds the bytes of `values` to slot `index`.
    pub fn set_slice<T: Pod>(&mut self, values: &[T], index: usize) -> Result<()> {
        self.set_bytes(bytemuck::cast_slice(values), index)
    }

    /// Binds `buffer`, starting `offset` bytes in, to slot `index`.
    pub fn set_buffer(&mut self, buffer: &Buffer, offset: u64, index: usize) -> Result<()> {
        let device = self.command_buffer.device();
        if buffer.shared.device_id != device.id() {
            return Err(ValidationFailure::DeviceMismatch { what: "buffer" }.into());
        }
        let limits = device.limits();
        let alignment = u64::from(limits.min_storage_buffer_offset_alignment)
            .max(u64::from(limits.min_uniform_buffer_offset_alignment));
        check_offset(offset, buffer.length(), alignment)?;
        self.arguments.bind(
            index,
            Argument::Buffer {
                buffer: buffer.shared.clone(),
                offset,
            },
        )?;
        Ok(())
    }

    /// Records a dispatch covering `threads_per_grid` threads, in groups of
    /// `threads_per_threadgroup`.
    ///
    /// Literal workgroup sizes must be matched exactly. Axes sized by an
    /// `override` accept any size within device limits; the first dispatch
    /// with a new shape builds a pipeline for it.
    /// Trailing groups may be partial; kernels bound-check their invocation id.
    pub fn dispatch_threads(
        &mut self,
        threads_per_grid: impl Into<Size3D>,
        threads_per_threadgroup: impl Into<Size3D>,
    ) -> Result<()> {
        let threads_per_threadgroup = threads_per_threadgroup.into();
        let device = self.command_buffer.device();
        let (groups, arguments) = plan_dispatch(
            self.pipeline.as_ref().map(ComputePipelineState::layout),
            &self.arguments,
            threads_per_grid.into(),
            threads_per_threadgroup,
            DispatchLimits::from(device.limits()),
        )?;
        let Some(pipeline) = self.pipeline.clone() else {
            return Err(ValidationFailure::NoPipelineBound.into());
        };
        let raw = pipeline.variant(device, threads_per_threadgroup)?;
        trace!(function = pipeline.function_name(), ?groups, "dispatch recorded");
        self.dispatches.push(RecordedDispatch {
            pipeline,
            raw,
            arguments,
            groups,
        });
        Ok(())
    }

    /// Closes the encoder and hands its dispatches to the command buffer.
    pub fn end_encoding(self) {
        self.command_buffer.finish_pass(RecordedPass {
            dispatches: self.dispatches,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::{ArgumentKind, ArgumentSlot},
        reflect::compile_wgsl,
    };

    fn layout(source: &str) -> DispatchLayout {
        let compiled = compile_wgsl(source).unwrap();
        DispatchLayout::from_reflection(&compiled.functions[0]).unwrap()
    }

    fn limits() -> DispatchLimits {
        DispatchLimits::from(&wgpu::Limits::default())
    }

    const FILL: &str = r#"
struct Params { value: u32, count: u32 }
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> out_data: array<u32>;

@compute @workgroup_size(4)
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < params.count) {
        out_data[id.x] = params.value;
    }
}
"#;

    #[test]
    fn dispatch_without_pipeline_is_rejected() {
        let table = ArgumentTable::default();
        let err = plan_dispatch(None, &table, Size3D::linear(4), Size3D::linear(4), limits())
            .err()
            .unwrap();
        assert_eq!(err, ValidationFailure::NoPipelineBound);

        let err = plan_dispatch(None, &table, Size3D::new(0, 1, 1), Size3D::ONE, limits())
            .err()
            .unwrap();
        assert_eq!(err, ValidationFailure::NoPipelineBound);
    }

    #[test]
    fn empty_shapes_are_rejected_first() {
        let layout = layout(FILL);
        let table = ArgumentTable::default();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(4, 0, 1),
            Size3D::linear(4),
            limits(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ValidationFailure::EmptyDimension { .. }));
    }

    #[test]
    fn index_and_size_limits() {
        let mut table = ArgumentTable::default();
        assert_eq!(
            table.bind_bytes(31, &[0; 4]),
            Err(ValidationFailure::IndexOutOfRange { index: 31, max: 31 })
        );
        assert_eq!(table.bind_bytes(0, &[]), Err(ValidationFailure::EmptyBytes));
        assert_eq!(
            table.bind_bytes(0, &[0; MAX_INLINE_BYTES + 1]),
            Err(ValidationFailure::BytesTooLarge {
                len: MAX_INLINE_BYTES + 1,
                max: MAX_INLINE_BYTES
            })
        );
        assert!(table.bind_bytes(30, &[0; MAX_INLINE_BYTES]).is_ok());
    }

    #[test]
    fn offsets_are_checked() {
        assert_eq!(
            check_offset(64, 64, 16),
            Err(ValidationFailure::OffsetOutOfBounds {
                offset: 64,
                length: 64
            })
        );
        assert_eq!(
            check_offset(8, 64, 16),
            Err(ValidationFailure::MisalignedOffset {
                offset: 8,
                alignment: 16
            })
        );
        assert!(check_offset(0, 1, 256).is_ok());
    }

    #[test]
    fn threadgroup_must_match_declaration() {
        let layout = layout(FILL);
        let table = ArgumentTable::default();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::linear(16),
            Size3D::linear(8),
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::ThreadgroupSizeMismatch {
                function: "fill".into(),
                expected: [4, 1, 1],
                got: [8, 1, 1],
            }
        );
    }

    const SCALED: &str = r#"
override block: u32 = 64;
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(block, block, 1)
fn square(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = id.y;
}
"#;

    #[test]
    fn override_axes_accept_any_consistent_shape() {
        let layout = layout(SCALED);
        let table = ArgumentTable::default();
        let (groups, _) = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(16, 16, 1),
            Size3D::new(4, 4, 1),
            limits(),
        )
        .unwrap();
        assert_eq!(groups, [4, 4, 1]);

        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(16, 16, 1),
            Size3D::new(4, 2, 1),
            limits(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ValidationFailure::ThreadgroupSizeMismatch { .. }));

        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(16, 16, 2),
            Size3D::new(4, 4, 2),
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::ThreadgroupSizeMismatch {
                function: "square".into(),
                expected: [64, 64, 1],
                got: [4, 4, 2],
            }
        );
    }

    #[test]
    fn group_shape_is_bounded_by_device_limits() {
        let layout = layout(SCALED);
        let table = ArgumentTable::default();
        let limits = limits();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(64, 64, 1),
            Size3D::new(32, 32, 1),
            limits,
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::ThreadgroupTooLarge {
                got: [32, 32, 1],
                max: limits.max_group_size,
                max_invocations: limits.max_invocations_per_group,
            }
        );
    }

    #[test]
    fn unbound_and_inline_writable_slots_are_rejected() {
        let layout = layout(FILL);
        let mut table = ArgumentTable::default();
        table.bind_bytes(0, bytemuck::bytes_of(&[7u32, 4])).unwrap();

        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::linear(4),
            Size3D::linear(4),
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::UnboundArgument {
                function: "fill".into(),
                index: 1
            }
        );

        table.bind_bytes(1, &[0; 16]).unwrap();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::linear(4),
            Size3D::linear(4),
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(err, ValidationFailure::InlineBytesForWritableSlot { index: 1 });
    }

    #[test]
    fn small_arguments_are_rejected() {
        let layout = layout(FILL);
        assert_eq!(
            layout.slots()[0],
            ArgumentSlot {
                index: 0,
                name: Some("params".into()),
                kind: ArgumentKind::Uniform,
                writes: false,
                min_size: 8,
            }
        );
        let mut table = ArgumentTable::default();
        table.bind_bytes(0, &[0; 4]).unwrap();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::linear(4),
            Size3D::linear(4),
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::ArgumentTooSmall {
                index: 0,
                available: 4,
                required: 8
            }
        );
    }

    #[test]
    fn grid_limit_is_enforced_per_axis() {
        let source = r#"
@compute @workgroup_size(1)
fn noop() {}
"#;
        let layout = layout(source);
        let table = ArgumentTable::default();
        let err = plan_dispatch(
            Some(&layout),
            &table,
            Size3D::new(1, 70_000, 1),
            Size3D::ONE,
            limits(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            ValidationFailure::GridTooLarge {
                axis: 1,
                groups: 70_000,
                limit: 65535
            }
        );
        let (groups, arguments) =
            plan_dispatch(Some(&layout), &table, Size3D::new(3, 2, 1), Size3D::ONE, limits())
                .unwrap();
        assert_eq!(groups, [3, 2, 1]);
        assert!(arguments.is_empty());
    }

    #[test]
    fn last_binding_wins() {
        let source = r#"
@group(0) @binding(0) var<uniform> value: u32;
@compute @workgroup_size(1)
fn read_value() { let v = value; }
"#;
        let layout = layout(source);
        let mut table = ArgumentTable::default();
        table.bind_bytes(0, &1u32.to_ne_bytes()).unwrap();
        table.bind_bytes(0, &[2, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let (_, arguments) =
            plan_dispatch(Some(&layout), &table, Size3D::ONE, Size3D::ONE, limits()).unwrap();
        match &arguments[0] {
            Argument::Bytes(bytes) => assert_eq!(bytes.len(), 8),
            Argument::Buffer { .. } => panic!("expected inline bytes"),
        }
    }
}
