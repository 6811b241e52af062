//! Tracing subscriber setup for embedding applications and tests

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`
///
/// `verbose` adds a DEBUG directive on top of the environment filter. Safe to
/// call more than once; later calls leave the installed subscriber in place
/// and return `false`.
pub fn init(verbose: bool) -> bool {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Logging initialized (verbose: {})", verbose);
    }
    installed
}
