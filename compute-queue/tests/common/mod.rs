use compute_queue::{Backend, CompileOptions, ComputePipelineState, Device, DeviceOptions};

/// A compute device, falling back to a software adapter. Without either the
/// test is skipped with a warning, or fails when `COMPUTE_QUEUE_REQUIRE_DEVICE`
/// is set.
pub fn device_or_skip() -> Option<Device> {
    compute_queue::logging::init_tracing();
    let err = match Device::system_default() {
        Ok(device) => return Some(device),
        Err(err) => err,
    };
    let fallback = DeviceOptions {
        force_fallback_adapter: true,
        backends: vec![Backend::Vulkan, Backend::Gl],
        ..Default::default()
    };
    match Device::with_options(&fallback) {
        Ok(device) => Some(device),
        Err(fallback_err) => {
            if std::env::var_os("COMPUTE_QUEUE_REQUIRE_DEVICE").is_some() {
                panic!("no compute device: {err}; fallback: {fallback_err}");
            }
            tracing::warn!("no compute device, skipping GPU test: {err}; fallback: {fallback_err}");
            eprintln!("skipping GPU test: no compute device");
            None
        }
    }
}

/// Compiles `source` and builds the pipeline for `name`.
#[allow(dead_code)]
pub fn pipeline(device: &Device, source: &str, name: &str) -> ComputePipelineState {
    let library = device
        .make_library(source, &CompileOptions::default())
        .expect("library compiles");
    let function = library.make_function(name).expect("function exists");
    device
        .make_compute_pipeline_state(&function)
        .expect("pipeline builds")
}
