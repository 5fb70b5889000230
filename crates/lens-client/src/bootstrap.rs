use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Installs the stderr subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
