//! Command line / environment configuration and logging setup.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use ecp_metrics_core::fetcher::{DbConfig, SslMode};
use ecp_metrics_core::poll::PollConfig;

#[derive(Parser, Debug)]
#[command(
    name = "ecp-metrics-server",
    about = "Exports ECP component directory contents as metrics",
    version = ecp_metrics_core::VERSION
)]
pub(crate) struct Args {
    /// Component directory database host.
    #[arg(long, env = "CD_DB_HOST")]
    pub(crate) db_host: String,

    /// Component directory database port.
    #[arg(long, env = "CD_DB_PORT", default_value = "5432")]
    pub(crate) db_port: u16,

    /// Component directory database name.
    #[arg(long, env = "CD_DB_NAME")]
    pub(crate) db_name: String,

    /// Database user.
    #[arg(long, env = "CD_DB_USER")]
    pub(crate) db_user: String,

    /// Database password.
    #[arg(long, env = "CD_DB_PASS", default_value = "", hide_env_values = true)]
    pub(crate) db_pass: String,

    /// TLS mode for the database connection: disable, require or verify-full.
    #[arg(long, env = "CD_DB_SSLMODE", default_value = "require")]
    pub(crate) db_sslmode: SslMode,

    /// Bearer token required on every /metrics request.
    #[arg(
        long,
        env = "AUTH_TOKEN",
        hide_env_values = true,
        value_parser = clap::builder::NonEmptyStringValueParser::new()
    )]
    pub(crate) auth_token: String,

    /// Listen host.
    #[arg(long, env = "LISTEN_HOST", default_value = "127.0.0.1")]
    pub(crate) listen_host: String,

    /// Listen port.
    #[arg(long, env = "LISTEN_PORT", default_value = "8080")]
    pub(crate) listen_port: u16,

    /// Seconds between polls while the directory is readable.
    #[arg(
        long,
        env = "CD_POLL_INTERVAL",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub(crate) poll_interval: u64,

    /// Seconds between polls after a failed fetch or parse.
    #[arg(
        long,
        env = "CD_RETRY_INTERVAL",
        default_value = "3",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub(crate) retry_interval: u64,

    /// Seconds to wait for each activity to confirm shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "5")]
    pub(crate) shutdown_timeout: u64,

    /// Seconds the HTTP server waits for in-flight requests on shutdown.
    #[arg(long, env = "HTTP_SHUTDOWN_GRACE", default_value = "3")]
    pub(crate) http_grace: u64,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub(crate) log_format: LogFormat,

    /// Log verbosity: 4 enables debug, 8 trace, negative values quieten.
    #[arg(long, env = "VERBOSITY", default_value = "0", allow_hyphen_values = true)]
    pub(crate) verbosity: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

impl Args {
    pub(crate) fn db_config(&self) -> DbConfig {
        DbConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            name: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_pass.clone(),
            ssl_mode: self.db_sslmode,
        }
    }

    pub(crate) fn poll_config(&self) -> PollConfig {
        PollConfig {
            steady_interval: Duration::from_secs(self.poll_interval),
            backoff_interval: Duration::from_secs(self.retry_interval),
        }
    }

    pub(crate) fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub(crate) fn http_grace(&self) -> Duration {
        Duration::from_secs(self.http_grace)
    }
}

/// Maps a slog-style verbosity to a tracing level. The threshold is
/// -verbosity and a record passes when its level is at or above it, with
/// trace -8, debug -4, info 0, warn 4 and error 8.
pub(crate) fn verbosity_level(verbosity: i32) -> LevelFilter {
    match verbosity.saturating_neg() {
        i32::MIN..=-8 => LevelFilter::TRACE,
        -7..=-4 => LevelFilter::DEBUG,
        -3..=0 => LevelFilter::INFO,
        1..=4 => LevelFilter::WARN,
        5..=8 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

/// Initializes the tracing subscriber. `RUST_LOG` takes precedence over `verbosity`.
pub(crate) fn init_logging(
    format: LogFormat,
    verbosity: i32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level(verbosity).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
