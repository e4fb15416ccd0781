//! Device selection and the per-device shared state.
//!
//! A [`Device`] owns the native device and queue, the error sink that routes
//! native validation errors back to the call that caused them, the submit
//! lock that orders commits, and the completion worker that retires them.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::{
    config::DeviceOptions,
    error::{Error, ExecutionError, Result},
    submission::CompletionWorker,
};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Read-only description of the selected adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Adapter name as reported by the driver.
    pub name: String,
    /// The adapter drives no display (CPU or virtual adapters).
    pub headless: bool,
    /// The adapter is an integrated, power-efficient GPU.
    pub low_power: bool,
    /// The adapter can be detached at runtime. Never reported by the native
    /// layer, so always `false`.
    pub removable: bool,
    /// Stable identifier packed as `vendor << 32 | device`.
    pub registry_id: u64,
    /// Native API in use.
    pub backend: wgpu::Backend,
    /// Adapter class.
    pub device_type: wgpu::DeviceType,
}

impl DeviceInfo {
    fn from_adapter(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            headless: is_headless(info.device_type),
            low_power: is_low_power(info.device_type),
            removable: false,
            registry_id: registry_id(info.vendor, info.device),
            backend: info.backend,
            device_type: info.device_type,
        }
    }
}

fn is_low_power(device_type: wgpu::DeviceType) -> bool {
    matches!(device_type, wgpu::DeviceType::IntegratedGpu)
}

fn is_headless(device_type: wgpu::DeviceType) -> bool {
    matches!(
        device_type,
        wgpu::DeviceType::Cpu | wgpu::DeviceType::VirtualGpu
    )
}

fn registry_id(vendor: u32, device: u32) -> u64 {
    ((vendor as u64) << 32) | device as u64
}

/// A native error raised while a capture was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CapturedError {
    Validation(String),
    OutOfMemory(String),
    Internal(String),
}

impl CapturedError {
    fn from_wgpu(error: &wgpu::Error) -> Self {
        match error {
            wgpu::Error::OutOfMemory { .. } => Self::OutOfMemory(error.to_string()),
            wgpu::Error::Validation { description, .. } => Self::Validation(description.clone()),
            #[allow(unreachable_patterns)]
            _ => Self::Internal(error.to_string()),
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Validation(message) | Self::OutOfMemory(message) | Self::Internal(message) => {
                message
            }
        }
    }

    /// All messages joined by newlines, or `None` when nothing was captured.
    pub(crate) fn join(errors: &[Self]) -> Option<String> {
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(Self::message)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Folds captured errors into the status of a submission.
    pub(crate) fn into_execution(errors: Vec<Self>) -> Option<ExecutionError> {
        let message = Self::join(&errors)?;
        if errors.iter().any(|e| matches!(e, Self::OutOfMemory(_))) {
            Some(ExecutionError::OutOfMemory { message })
        } else {
            Some(ExecutionError::Rejected { message })
        }
    }
}

#[derive(Default)]
struct ErrorSink {
    active: Mutex<Option<(ThreadId, Vec<CapturedError>)>>,
    scope: Mutex<()>,
}

impl ErrorSink {
    fn report(&self, error: wgpu::Error) {
        let mut active = self.active.lock();
        if let Some((owner, captured)) = active.as_mut()
            && *owner == thread::current().id()
        {
            captured.push(CapturedError::from_wgpu(&error));
            return;
        }
        drop(active);
        error!("uncaptured native error: {error}");
    }
}

pub(crate) struct DeviceShared {
    id: u64,
    raw: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    info: DeviceInfo,
    limits: wgpu::Limits,
    errors: Arc<ErrorSink>,
    lost: Arc<Mutex<Option<String>>>,
    submit_lock: Mutex<()>,
    worker: CompletionWorker,
}

/// A compute device.
///
/// Cheap to clone; all clones refer to the same native device. Never
/// destroyed explicitly, the native device goes away with the last clone.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("info", &self.shared.info)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Device {}

impl Device {
    /// Selects the default compute device.
    pub fn system_default() -> Result<Self> {
        Self::with_options(&DeviceOptions::default())
    }

    /// Selects a compute device according to `options`.
    pub fn with_options(options: &DeviceOptions) -> Result<Self> {
        pollster::block_on(Self::request(options))
    }

    async fn request(options: &DeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.wgpu_backends(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference.to_wgpu(),
                compatible_surface: None,
                force_fallback_adapter: options.force_fallback_adapter,
            })
            .await
            .map_err(|e| Error::NoDeviceFound {
                reason: e.to_string(),
            })?;

        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: options.label.as_deref(),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::default(),
            })
            .await
            .map_err(|e| Error::NoDeviceFound {
                reason: format!("{}: {e}", adapter_info.name),
            })?;

        let info = DeviceInfo::from_adapter(&adapter_info);
        let limits = device.limits();
        let raw = Arc::new(device);
        let errors = Arc::new(ErrorSink::default());
        let lost = Arc::new(Mutex::new(None));
        install_device_error_handlers(&raw, errors.clone(), lost.clone());

        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let worker = CompletionWorker::spawn(id, raw.clone(), lost.clone()).map_err(|e| {
            Error::NoDeviceFound {
                reason: format!("failed to start completion worker: {e}"),
            }
        })?;

        info!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected compute device"
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                id,
                raw,
                queue,
                info,
                limits,
                errors,
                lost,
                submit_lock: Mutex::new(()),
                worker,
            }),
        })
    }

    /// Adapter description.
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Limits of the native device.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.shared.limits
    }

    /// Whether the native device has been lost.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.lock().is_some()
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn raw(&self) -> &wgpu::Device {
        &self.shared.raw
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.shared.queue
    }

    pub(crate) fn worker(&self) -> &CompletionWorker {
        &self.shared.worker
    }

    pub(crate) fn lost_reason(&self) -> Option<String> {
        self.shared.lost.lock().clone()
    }

    /// Serializes commits so uploads, submissions and retirements share one order.
    pub(crate) fn lock_submissions(&self) -> MutexGuard<'_, ()> {
        self.shared.submit_lock.lock()
    }

    /// Runs `f`, collecting native errors it raises on this thread.
    pub(crate) fn capture_errors<T>(&self, f: impl FnOnce() -> T) -> (T, Vec<CapturedError>) {
        let sink = &self.shared.errors;
        let _scope = sink.scope.lock();
        *sink.active.lock() = Some((thread::current().id(), Vec::new()));
        let value = f();
        let captured = sink
            .active
            .lock()
            .take()
            .map(|(_, captured)| captured)
            .unwrap_or_default();
        (value, captured)
    }
}

fn install_device_error_handlers(
    device: &wgpu::Device,
    sink: Arc<ErrorSink>,
    lost: Arc<Mutex<Option<String>>>,
) {
    device.on_uncaptured_error(Arc::new(move |error: wgpu::Error| sink.report(error)));
    device.set_device_lost_callback(move |reason, message| {
        error!("compute device lost: reason={reason:?}, message={message}");
        *lost.lock() = Some(format!("{reason:?}: {message}"));
    });
}

/// Whether any compute device can be selected on this system.
pub fn is_available() -> bool {
    let options = DeviceOptions::default();
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: options.wgpu_backends(),
        ..Default::default()
    });
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: options.power_preference.to_wgpu(),
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .is_ok()
}
