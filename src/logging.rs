use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// The filter comes from `PRICELIST_LOG`, then `RUST_LOG`, else `info`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(service: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(service, "tracing initialised");
    }
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PRICELIST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
