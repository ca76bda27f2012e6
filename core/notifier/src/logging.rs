use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn setup() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

/// Routes output through the test harness. Safe to call from every test.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
