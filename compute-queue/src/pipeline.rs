//! Compute pipeline states.
//!
//! # Overview
//!
//! A [`ComputePipelineState`] is the executable form of one compute
//! [`Function`]. Building it lowers the function's reflected bindings into a
//! [`DispatchLayout`]: the ordered list of argument slots the kernel touches,
//! what kind of buffer each slot expects and whether the kernel writes it.
//! The encoder checks every dispatch against this layout before anything is
//! recorded, and the command buffer uses it to build bind groups at commit.
//!
//! # Argument slots
//!
//! Slot `i` is `@group(0) @binding(i)`. Only group 0 is addressable, only
//! uniform and storage buffers are accepted, and slot indices stop at
//! [`MAX_ARGUMENT_SLOTS`]. Anything else fails the build with
//! [`Error::PipelineBuild`].
//!
//! # Group shape
//!
//! A kernel declared with literal sizes, such as `@workgroup_size(64)`, only
//! accepts that group shape. An axis sized by a plain `override` declaration
//! accepts any shape within device limits: the first dispatch with a new
//! shape builds a native pipeline with the override set to that size, and the
//! state keeps it for later dispatches.
//!
//! # Determinism
//!
//! The layout depends only on the reflected function, so building twice from
//! the same function yields equal layouts. States are not cached here; callers
//! that want reuse keep the handle, which is cheap to clone.

use std::{fmt, num::NonZeroU64, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{
    device::{CapturedError, Device},
    encoder::MAX_ARGUMENT_SLOTS,
    error::{Error, Result, ValidationFailure},
    library::Function,
    reflect::{FunctionReflection, FunctionStage, ResourceClass, WorkgroupOverride},
    size::Size3D,
};

/// Buffer kind an argument slot expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    /// Uniform buffer.
    Uniform,
    /// Storage buffer.
    Storage {
        /// The kernel declared the binding `read`.
        read_only: bool,
    },
}

/// One argument slot used by a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgumentSlot {
    /// Slot index, equal to the `@binding` number.
    pub index: u32,
    /// Declared variable name.
    pub name: Option<String>,
    /// Expected buffer kind.
    pub kind: ArgumentKind,
    /// The kernel stores through this slot.
    pub writes: bool,
    /// Bytes the bound argument must provide.
    pub min_size: u64,
}

/// The argument table and group shape a dispatch must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchLayout {
    function: String,
    workgroup_size: Size3D,
    overrides: [Option<String>; 3],
    slots: Vec<ArgumentSlot>,
}

impl DispatchLayout {
    pub(crate) fn from_reflection(reflection: &FunctionReflection) -> Result<Self> {
        let fail = |diagnostic: String| Error::PipelineBuild {
            diagnostic: format!("`{}`: {diagnostic}", reflection.name),
        };

        if reflection.stage != FunctionStage::Compute {
            return Err(fail(format!(
                "not a compute entry point (stage {:?})",
                reflection.stage
            )));
        }
        let mut default_size = reflection.workgroup_size;
        let mut overrides: [Option<String>; 3] = Default::default();
        for (axis, sizing) in reflection.workgroup_overrides.iter().enumerate() {
            match sizing {
                None => {}
                Some(WorkgroupOverride::Constant { key, default }) => {
                    default_size[axis] = default.unwrap_or(1);
                    overrides[axis] = Some(key.clone());
                }
                Some(WorkgroupOverride::Expression) => {
                    return Err(fail(
                        "workgroup size is an override expression; only a plain override can size an axis"
                            .into(),
                    ));
                }
            }
        }
        let workgroup_size = Size3D::from(default_size);
        if workgroup_size.ensure_non_empty("workgroup size").is_err() {
            return Err(fail(format!(
                "workgroup size {default_size:?} has an empty axis"
            )));
        }

        let mut slots = Vec::with_capacity(reflection.bindings.len());
        for binding in &reflection.bindings {
            let name = binding.name.as_deref().unwrap_or("<anonymous>");
            if binding.group != 0 {
                return Err(fail(format!(
                    "`{name}` uses @group({}); only group 0 is addressable",
                    binding.group
                )));
            }
            if binding.binding as usize >= MAX_ARGUMENT_SLOTS {
                return Err(fail(format!(
                    "`{name}` uses @binding({}); slots stop at {}",
                    binding.binding,
                    MAX_ARGUMENT_SLOTS - 1
                )));
            }
            let kind = match &binding.class {
                ResourceClass::Uniform => ArgumentKind::Uniform,
                ResourceClass::Storage { read_only } => ArgumentKind::Storage {
                    read_only: *read_only,
                },
                ResourceClass::Other(ty) => {
                    return Err(fail(format!(
                        "`{name}` is a {ty}; only uniform and storage buffers can be bound"
                    )));
                }
            };
            slots.push(ArgumentSlot {
                index: binding.binding,
                name: binding.name.clone(),
                kind,
                writes: binding.writes,
                min_size: binding.min_size,
            });
        }

        Ok(Self {
            function: reflection.name.clone(),
            workgroup_size,
            overrides,
            slots,
        })
    }

    /// Kernel name.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Declared workgroup size. Override-sized axes report their default, or
    /// 1 when the override has none.
    pub fn workgroup_size(&self) -> Size3D {
        self.workgroup_size
    }

    /// Whether every axis of the group shape is a literal.
    pub fn is_threadgroup_size_fixed(&self) -> bool {
        self.overrides.iter().all(Option::is_none)
    }

    /// Pipeline constant sizing `axis` (0 = x), if any.
    pub(crate) fn axis_override(&self, axis: usize) -> Option<&str> {
        self.overrides.get(axis)?.as_deref()
    }

    /// Pipeline constants that size the workgroup to `group`.
    fn constants(&self, group: Size3D) -> Vec<(&str, f64)> {
        let group = group.to_array();
        let mut constants: Vec<(&str, f64)> = Vec::new();
        for (axis, key) in self.overrides.iter().enumerate() {
            let Some(key) = key.as_deref() else { continue };
            if constants.iter().all(|(seen, _)| *seen != key) {
                constants.push((key, f64::from(group[axis])));
            }
        }
        constants
    }

    /// Slots the kernel uses, ascending by index.
    pub fn slots(&self) -> &[ArgumentSlot] {
        &self.slots
    }

    fn check_device_limits(&self, limits: &wgpu::Limits) -> Result<()> {
        let size = self.workgroup_size;
        let axes = [
            (size.width, limits.max_compute_workgroup_size_x),
            (size.height, limits.max_compute_workgroup_size_y),
            (size.depth, limits.max_compute_workgroup_size_z),
        ];
        let over_axis = axes.iter().any(|(got, max)| got > max);
        if over_axis || size.volume() > limits.max_compute_invocations_per_workgroup as u64 {
            return Err(Error::PipelineBuild {
                diagnostic: format!(
                    "`{}`: workgroup size {:?} exceeds device limits ({}x{}x{}, {} invocations)",
                    self.function,
                    size.to_array(),
                    limits.max_compute_workgroup_size_x,
                    limits.max_compute_workgroup_size_y,
                    limits.max_compute_workgroup_size_z,
                    limits.max_compute_invocations_per_workgroup,
                ),
            });
        }
        Ok(())
    }

    fn bind_group_layout_entries(&self) -> Vec<wgpu::BindGroupLayoutEntry> {
        self.slots
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.index,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match slot.kind {
                        ArgumentKind::Uniform => wgpu::BufferBindingType::Uniform,
                        ArgumentKind::Storage { read_only } => {
                            wgpu::BufferBindingType::Storage { read_only }
                        }
                    },
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(slot.min_size),
                },
                count: None,
            })
            .collect()
    }
}

struct PipelineInner {
    device_id: u64,
    layout: DispatchLayout,
    module: wgpu::ShaderModule,
    pipeline_layout: wgpu::PipelineLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    /// Native pipelines keyed by group shape. Literal-sized kernels only ever
    /// hold the declared shape.
    variants: Mutex<FxHashMap<[u32; 3], wgpu::ComputePipeline>>,
    max_threads: u32,
}

fn build_variant(
    device: &wgpu::Device,
    layout: &DispatchLayout,
    module: &wgpu::ShaderModule,
    pipeline_layout: &wgpu::PipelineLayout,
    group: Size3D,
) -> wgpu::ComputePipeline {
    let constants = layout.constants(group);
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(layout.function()),
        layout: Some(pipeline_layout),
        module,
        entry_point: Some(layout.function()),
        compilation_options: wgpu::PipelineCompilationOptions {
            constants: &constants,
            zero_initialize_workgroup_memory: true,
        },
        cache: None,
    })
}

/// An immutable, shareable compute pipeline.
#[derive(Clone)]
pub struct ComputePipelineState {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for ComputePipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputePipelineState")
            .field("layout", &self.inner.layout)
            .finish()
    }
}

impl ComputePipelineState {
    /// Declared group shape. Literal-sized kernels must be dispatched with
    /// exactly this shape; override-sized axes report their default.
    pub fn threadgroup_size(&self) -> Size3D {
        self.inner.layout.workgroup_size
    }

    /// Largest number of threads one group may hold: the declared volume for
    /// literal-sized kernels, the device limit for override-sized ones.
    pub fn max_total_threads_per_threadgroup(&self) -> u32 {
        self.inner.max_threads
    }

    /// Name of the function this state was built from.
    pub fn function_name(&self) -> &str {
        &self.inner.layout.function
    }

    /// Argument slots the kernel uses.
    pub fn argument_slots(&self) -> &[ArgumentSlot] {
        &self.inner.layout.slots
    }

    /// The full dispatch layout.
    pub fn layout(&self) -> &DispatchLayout {
        &self.inner.layout
    }

    pub(crate) fn device_id(&self) -> u64 {
        self.inner.device_id
    }

    /// Native pipeline for dispatches in groups of `group`, built on first
    /// use for override-sized kernels. `group` must already have passed
    /// dispatch validation.
    pub(crate) fn variant(&self, device: &Device, group: Size3D) -> Result<wgpu::ComputePipeline> {
        let key = group.to_array();
        if let Some(raw) = self.inner.variants.lock().get(&key) {
            return Ok(raw.clone());
        }

        let inner = &*self.inner;
        let (raw, errors) = device.capture_errors(|| {
            build_variant(
                device.raw(),
                &inner.layout,
                &inner.module,
                &inner.pipeline_layout,
                group,
            )
        });
        if let Some(diagnostic) = CapturedError::join(&errors) {
            return Err(Error::PipelineBuild { diagnostic });
        }
        debug!(
            function = inner.layout.function(),
            group = ?key,
            "compute pipeline variant built"
        );
        Ok(inner.variants.lock().entry(key).or_insert(raw).clone())
    }

    pub(crate) fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.inner.bind_group_layout
    }
}

impl Device {
    /// Builds a compute pipeline state from `function`.
    pub fn make_compute_pipeline_state(
        &self,
        function: &Function<'_>,
    ) -> Result<ComputePipelineState> {
        let library = function.library();
        if library.device().id() != self.id() {
            return Err(ValidationFailure::DeviceMismatch { what: "function" }.into());
        }

        let layout = DispatchLayout::from_reflection(function.reflection())?;
        layout.check_device_limits(self.limits())?;

        let device = self.raw();
        let ((raw, bind_group_layout, pipeline_layout), errors) = self.capture_errors(|| {
            let bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(layout.function()),
                    entries: &layout.bind_group_layout_entries(),
                });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(layout.function()),
                bind_group_layouts: &[&bind_group_layout],
                immediate_size: 0,
            });
            let raw = build_variant(
                device,
                &layout,
                &library.module,
                &pipeline_layout,
                layout.workgroup_size(),
            );
            (raw, bind_group_layout, pipeline_layout)
        });
        if let Some(diagnostic) = CapturedError::join(&errors) {
            return Err(Error::PipelineBuild { diagnostic });
        }

        debug!(
            function = layout.function(),
            slots = layout.slots().len(),
            workgroup_size = ?layout.workgroup_size().to_array(),
            "compute pipeline built"
        );
        let max_threads = if layout.is_threadgroup_size_fixed() {
            u32::try_from(layout.workgroup_size().volume()).unwrap_or(u32::MAX)
        } else {
            self.limits().max_compute_invocations_per_workgroup
        };
        let mut variants = FxHashMap::default();
        variants.insert(layout.workgroup_size().to_array(), raw);
        Ok(ComputePipelineState {
            inner: Arc::new(PipelineInner {
                device_id: self.id(),
                layout,
                module: library.module.clone(),
                pipeline_layout,
                bind_group_layout,
                variants: Mutex::new(variants),
                max_threads,
            }),
        })
    }
}
