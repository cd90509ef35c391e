use tracing_subscriber::{
    filter::filter_fn, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Installs a formatting subscriber filtered by `RUST_LOG`, `info` when unset.
///
/// Records emitted through `log` are forwarded to it.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_filter(filter)
        .with_filter(filter_fn(|metadata| {
            // wgpu is very chatty at info level.
            !metadata
                .module_path()
                .is_some_and(|path| path.starts_with("wgpu"))
                || *metadata.level() < tracing_subscriber::filter::LevelFilter::INFO
        }));

    // Fails when a subscriber is already installed, which is fine.
    let _ = registry().with(layer).try_init();
}
