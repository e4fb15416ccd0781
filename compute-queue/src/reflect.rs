//! Front-end compilation and reflection of WGSL kernels.
//!
//! Source is parsed and validated with `naga` before it ever reaches the
//! native layer, which gives callers a source-annotated diagnostic and gives
//! the pipeline builder the argument table each entry point actually uses.

use crate::error::{Error, Result};

/// Pipeline stage of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionStage {
    /// A compute kernel.
    Compute,
    /// A vertex shader.
    Vertex,
    /// A fragment shader.
    Fragment,
    /// Any other stage the front end knows about.
    Other,
}

impl From<naga::ShaderStage> for FunctionStage {
    fn from(stage: naga::ShaderStage) -> Self {
        match stage {
            naga::ShaderStage::Compute => Self::Compute,
            naga::ShaderStage::Vertex => Self::Vertex,
            naga::ShaderStage::Fragment => Self::Fragment,
            #[allow(unreachable_patterns)]
            _ => Self::Other,
        }
    }
}

/// What kind of resource a binding refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// `var<uniform>`.
    Uniform,
    /// `var<storage, read>` or `var<storage, read_write>`.
    Storage {
        /// Whether the declaration forbids stores.
        read_only: bool,
    },
    /// Textures, samplers and anything else that is not a plain buffer.
    Other(String),
}

/// A resource binding statically used by one entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReflectedBinding {
    /// `@group` index.
    pub group: u32,
    /// `@binding` index.
    pub binding: u32,
    /// Declared variable name.
    pub name: Option<String>,
    /// Resource kind.
    pub class: ResourceClass,
    /// Whether the entry point stores through this binding.
    pub writes: bool,
    /// Minimum byte size of the bound type.
    pub min_size: u64,
}

/// A `@workgroup_size` dimension that is not a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkgroupOverride {
    /// Sized directly by an `override` declaration.
    Constant {
        /// Pipeline constant key: the `@id` when declared, else the name.
        key: String,
        /// Literal initializer, if any.
        default: Option<u32>,
    },
    /// Any other override expression, such as `block * 2`.
    Expression,
}

/// Everything the pipeline builder needs to know about one entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionReflection {
    /// Entry point name.
    pub name: String,
    /// Stage.
    pub stage: FunctionStage,
    /// Declared `@workgroup_size`; all ones for non-compute stages. Only
    /// meaningful on axes without an override.
    pub workgroup_size: [u32; 3],
    /// Per axis, the override sizing it, if any.
    pub workgroup_overrides: [Option<WorkgroupOverride>; 3],
    /// Bindings the entry point reads or writes, ordered by group then binding.
    pub bindings: Vec<ReflectedBinding>,
}

/// A parsed and validated module with its reflected entry points.
pub(crate) struct CompiledModule {
    pub(crate) functions: Vec<FunctionReflection>,
}

/// Parses and validates `source`, returning [`Error::Compile`] with an
/// annotated diagnostic on failure.
pub(crate) fn compile_wgsl(source: &str) -> Result<CompiledModule> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| Error::Compile {
        diagnostic: err.emit_to_string(source),
    })?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|err| Error::Compile {
        diagnostic: err.emit_to_string(source),
    })?;

    Ok(CompiledModule {
        functions: reflect_module(&module, &info),
    })
}

fn reflect_module(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
) -> Vec<FunctionReflection> {
    module
        .entry_points
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let usage = info.get_entry_point(index);
            let mut bindings: Vec<_> = module
                .global_variables
                .iter()
                .filter_map(|(handle, var)| {
                    let use_flags = usage[handle];
                    if use_flags.is_empty() {
                        return None;
                    }
                    let binding = var.binding.as_ref()?;
                    Some(ReflectedBinding {
                        group: binding.group,
                        binding: binding.binding,
                        name: var.name.clone(),
                        class: classify(module, var),
                        writes: use_flags.contains(naga::valid::GlobalUse::WRITE),
                        min_size: module.types[var.ty].inner.size(module.to_ctx()) as u64,
                    })
                })
                .collect();
            bindings.sort_by_key(|b| (b.group, b.binding));

            let stage = FunctionStage::from(entry.stage);
            let compute = stage == FunctionStage::Compute;
            FunctionReflection {
                name: entry.name.clone(),
                stage,
                workgroup_size: if compute {
                    entry.workgroup_size
                } else {
                    [1, 1, 1]
                },
                workgroup_overrides: match entry.workgroup_size_overrides {
                    Some(overrides) if compute => {
                        overrides.map(|expr| expr.map(|expr| workgroup_override(module, expr)))
                    }
                    _ => [None, None, None],
                },
                bindings,
            }
        })
        .collect()
}

fn workgroup_override(
    module: &naga::Module,
    expr: naga::Handle<naga::Expression>,
) -> WorkgroupOverride {
    let naga::Expression::Override(handle) = module.global_expressions[expr] else {
        return WorkgroupOverride::Expression;
    };
    let decl = &module.overrides[handle];
    let key = match (decl.id, &decl.name) {
        (Some(id), _) => id.to_string(),
        (None, Some(name)) => name.clone(),
        (None, None) => return WorkgroupOverride::Expression,
    };
    let default = decl
        .init
        .and_then(|init| literal_u32(&module.global_expressions[init]));
    WorkgroupOverride::Constant { key, default }
}

fn literal_u32(expr: &naga::Expression) -> Option<u32> {
    match *expr {
        naga::Expression::Literal(naga::Literal::U32(value)) => Some(value),
        naga::Expression::Literal(naga::Literal::I32(value)) => u32::try_from(value).ok(),
        naga::Expression::Literal(naga::Literal::AbstractInt(value)) => u32::try_from(value).ok(),
        _ => None,
    }
}

fn classify(module: &naga::Module, var: &naga::GlobalVariable) -> ResourceClass {
    match var.space {
        naga::AddressSpace::Uniform => ResourceClass::Uniform,
        naga::AddressSpace::Storage { access } => ResourceClass::Storage {
            read_only: !access.contains(naga::StorageAccess::STORE),
        },
        _ => {
            let ty = &module.types[var.ty];
            ResourceClass::Other(
                ty.name
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", ty.inner)),
            )
        }
    }
}
