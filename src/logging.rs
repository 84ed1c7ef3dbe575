use env_logger::Env;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the process-wide logger. Calling it twice is harmless.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER))
        .format_timestamp_secs()
        .try_init();
}

/// Logger for unit tests: captured output, everything enabled.
#[cfg(test)]
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
