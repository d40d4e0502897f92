//! Logging setup.
//!
//! Log output goes to the stderr of the [`Env`], so that tests can capture
//! it like any other output.

use tracing::level_filters::LevelFilter;

use crate::env::Env;

/// The most verbose level shown for the given number of `-v` flags.
pub fn level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Run `f` with log events written to the stderr of `env`.
pub fn with_logging<T>(env: &impl Env, verbose: u8, f: impl FnOnce() -> T) -> T {
    let stderr = env.stderr();
    let ansi = stderr.is_terminal();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(stderr)
        .with_ansi(ansi)
        .with_max_level(level(verbose))
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::fake::FakeEnv;

    #[test]
    fn events_reach_env_stderr() {
        let env = FakeEnv::default();
        with_logging(&env, 0, || {
            tracing::info!(zone = "example.net.", "hello");
            tracing::debug!("hidden");
        });
        let stderr = env.get_stderr();
        assert!(stderr.contains("INFO"), "{stderr}");
        assert!(stderr.contains("hello"));
        assert!(stderr.contains("example.net."));
        assert!(!stderr.contains("hidden"));

        let env = FakeEnv::default();
        with_logging(&env, 1, || tracing::debug!("shown"));
        assert!(env.get_stderr().contains("shown"));
    }
}
