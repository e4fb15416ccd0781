//! Compiled shader libraries and the functions they export.

use std::{borrow::Cow, fmt};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    device::{CapturedError, Device},
    error::{Error, Result},
    reflect::{self, FunctionReflection, FunctionStage},
    size::Size3D,
};

/// Shading language version, packed as `major << 16 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageVersion(u32);

impl LanguageVersion {
    /// WGSL 1.0.
    pub const WGSL_1_0: Self = Self::new(1, 0);

    /// Versions this compiler accepts.
    pub const SUPPORTED: &'static [Self] = &[Self::WGSL_1_0];

    /// Packs a version.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    /// Wraps a raw packed value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The packed value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Major component.
    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Minor component.
    pub const fn minor(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }
}

impl Default for LanguageVersion {
    fn default() -> Self {
        Self::WGSL_1_0
    }
}

impl fmt::Display for LanguageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Options for [`Device::make_library`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Source language version.
    pub language_version: LanguageVersion,
    /// Debug label for the native shader module.
    pub label: Option<String>,
}

/// A compiled shader module and its exported functions.
pub struct Library {
    device: Device,
    label: Option<String>,
    options: CompileOptions,
    pub(crate) module: wgpu::ShaderModule,
    functions: Vec<FunctionReflection>,
    by_name: FxHashMap<String, usize>,
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("label", &self.label)
            .field("language_version", &self.options.language_version)
            .field("functions", &self.function_names().collect::<Vec<_>>())
            .finish()
    }
}

impl Library {
    /// Looks up an entry point by exact, case-sensitive name.
    pub fn make_function(&self, name: &str) -> Result<Function<'_>> {
        let index = self
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::FunctionNotFound {
                name: name.to_string(),
            })?;
        Ok(Function {
            library: self,
            reflection: &self.functions[index],
        })
    }

    /// Names of every entry point, in declaration order.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }

    /// Debug label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Options the library was compiled with.
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Device that owns the native module.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// A named entry point, borrowed from its [`Library`].
#[derive(Clone, Copy)]
pub struct Function<'lib> {
    library: &'lib Library,
    reflection: &'lib FunctionReflection,
}

impl fmt::Debug for Function<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.reflection.name)
            .field("stage", &self.reflection.stage)
            .field("workgroup_size", &self.reflection.workgroup_size)
            .finish()
    }
}

impl<'lib> Function<'lib> {
    /// Entry point name.
    pub fn name(&self) -> &'lib str {
        &self.reflection.name
    }

    /// Pipeline stage.
    pub fn stage(&self) -> FunctionStage {
        self.reflection.stage
    }

    /// Declared `@workgroup_size`.
    pub fn workgroup_size(&self) -> Size3D {
        Size3D::from(self.reflection.workgroup_size)
    }

    /// Owning library.
    pub fn library(&self) -> &'lib Library {
        self.library
    }

    pub(crate) fn reflection(&self) -> &'lib FunctionReflection {
        self.reflection
    }
}

fn check_language_version(version: LanguageVersion) -> Result<()> {
    if version.is_supported() {
        return Ok(());
    }
    let supported = LanguageVersion::SUPPORTED
        .iter()
        .map(|v| format!("{v} ({:#x})", v.raw()))
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::Compile {
        diagnostic: format!(
            "unsupported language version {version} ({:#x}); supported: {supported}",
            version.raw()
        ),
    })
}

impl Device {
    /// Compiles WGSL source into a [`Library`].
    ///
    /// Source is validated in-process first, so a failure carries a
    /// diagnostic annotated with source locations and no handle is produced.
    pub fn make_library(&self, source: &str, options: &CompileOptions) -> Result<Library> {
        check_language_version(options.language_version)?;
        let compiled = reflect::compile_wgsl(source)?;

        let (module, errors) = self.capture_errors(|| {
            self.raw()
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: options.label.as_deref(),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
                })
        });
        if let Some(diagnostic) = CapturedError::join(&errors) {
            return Err(Error::Compile { diagnostic });
        }

        let by_name = compiled
            .functions
            .iter()
            .enumerate()
            .map(|(index, function)| (function.name.clone(), index))
            .collect();
        debug!(
            label = options.label.as_deref().unwrap_or("<unnamed>"),
            functions = compiled.functions.len(),
            "library compiled"
        );

        Ok(Library {
            device: self.clone(),
            label: options.label.clone(),
            options: options.clone(),
            module,
            functions: compiled.functions,
            by_name,
        })
    }
}
