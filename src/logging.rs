//! Diagnostic logging setup.
//!
//! Logs go to stderr so they never interleave with the conversation printed on
//! stdout. The filter comes from `SHELLMATE_LOG` (e.g. `shellmate=debug`).

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "SHELLMATE_LOG";

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
