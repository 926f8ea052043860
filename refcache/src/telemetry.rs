//! Tracing subscriber initialization.
//!
//! Log verbosity is controlled with the standard `RUST_LOG` environment variable and defaults to
//! `info`. Output is either human readable text or one JSON object per line, selected by the
//! `log_format` configuration value:
//!
//! ```yaml
//! log_format: json
//! ```
//!
//! ```bash
//! RUST_LOG=refcache=debug refcache -f config.yaml --resource project p-1 p-2
//! ```

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogFormat;

/// Initialize tracing with a console fmt layer in the requested format.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()?;
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    info!(?format, "Telemetry initialized");

    Ok(())
}
