mod access_log;
mod auth;
mod config;
mod exporter;
mod handlers;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use ecp_metrics_core::SnapshotStore;
use ecp_metrics_core::fetcher::{ConnectionPool, PgFetcher, PoolLimits, PoolStats};
use ecp_metrics_core::poll::{PollError, PollLoop};

use auth::BearerToken;
use config::Args;
use exporter::ExporterError;

/// How often connection pool usage is logged at debug level.
const POOL_STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Poll failures buffered for the coordinator; extra ones are dropped.
const POLL_ERROR_BACKLOG: usize = 16;

// ============================================================
// Entry point
// ============================================================

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version are not failures.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    if let Err(e) = config::init_logging(args.log_format, args.verbosity) {
        eprintln!("failed to initialize logging: {e}");
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    let code = runtime.block_on(async_main(args));
    // Blocking tasks abandoned after a shutdown timeout must not hold the process.
    runtime.shutdown_background();
    process::exit(code);
}

async fn async_main(args: Args) -> i32 {
    info!(version = ecp_metrics_core::VERSION, "starting ecp-metrics-server");

    let db = args.db_config();
    let pool = match db.pool(PoolLimits::default()) {
        Ok(pool) => pool,
        Err(e) => {
            error!(url = %db.redacted_url(), error = %e, "failed to set up database connection");
            return 1;
        }
    };
    info!(url = %db.redacted_url(), "component directory database configured");

    let listener = match exporter::bind(&args.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to start HTTP server");
            return 1;
        }
    };

    let store = Arc::new(SnapshotStore::new());
    let token = Arc::new(BearerToken::new(&args.auth_token));
    let cancel = CancellationToken::new();

    let activities = Activities::start(&args, pool.clone(), store, token, listener, &cancel);
    let code = activities.supervise(&cancel, args.shutdown_timeout()).await;

    close_pool(pool, args.shutdown_timeout()).await;
    info!(exit_code = code, "exiting");
    code
}

// ============================================================
// Coordinator
// ============================================================

/// Long-running tasks owned by the coordinator.
struct Activities {
    exporter: JoinHandle<()>,
    poller: JoinHandle<()>,
    pool_stats: JoinHandle<()>,
    fatal: mpsc::Receiver<ExporterError>,
    poll_errors: mpsc::Receiver<PollError>,
}

impl Activities {
    fn start(
        args: &Args,
        pool: ConnectionPool,
        store: Arc<SnapshotStore>,
        token: Arc<BearerToken>,
        listener: tokio::net::TcpListener,
        cancel: &CancellationToken,
    ) -> Self {
        let (fatal_tx, fatal) = mpsc::channel(1);
        let (poll_errors_tx, poll_errors) = mpsc::channel(POLL_ERROR_BACKLOG);

        let router = exporter::build_router(store.clone(), token);
        let exporter = tokio::spawn(
            {
                let cancel = cancel.child_token();
                let grace = args.http_grace();
                async move {
                    if let Err(e) = exporter::serve(listener, router, cancel, grace).await {
                        let _ = fatal_tx.send(e).await;
                    }
                }
            }
            .instrument(info_span!("server")),
        );

        let poll = PollLoop::new(
            Arc::new(PgFetcher::new(pool.clone())),
            store,
            args.poll_config(),
        )
        .with_observer(poll_errors_tx);
        let poller = tokio::spawn(
            poll.run(cancel.child_token())
                .instrument(info_span!("cd_service")),
        );

        let pool_stats = tokio::spawn(log_pool_stats(pool, cancel.child_token()));

        Self {
            exporter,
            poller,
            pool_stats,
            fatal,
            poll_errors,
        }
    }

    /// Waits for a stop condition, cancels every activity and waits for each
    /// one independently. Returns the process exit code.
    async fn supervise(mut self, cancel: &CancellationToken, timeout: Duration) -> i32 {
        let mut code = 0;
        let mut poll_failures: u64 = 0;

        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                name = &mut signal => {
                    info!(signal = name, "received signal, shutting down");
                    break;
                }
                Some(e) = self.fatal.recv() => {
                    error!(error = %e, "unrecoverable error, shutting down");
                    code = 1;
                    break;
                }
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                Some(e) = self.poll_errors.recv() => {
                    poll_failures += 1;
                    debug!(error = %e, poll_failures, "poll cycle failed");
                }
            }
        }

        cancel.cancel();

        let results = [
            wait_for("HTTP server", self.exporter, timeout).await,
            wait_for("CD poll loop", self.poller, timeout).await,
            wait_for("pool stats", self.pool_stats, timeout).await,
        ];
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "forced shutdown");
                code = 1;
            }
        }

        while let Ok(e) = self.poll_errors.try_recv() {
            poll_failures += 1;
            debug!(error = %e, poll_failures, "poll cycle failed");
        }
        if poll_failures > 0 {
            warn!(poll_failures, "poll cycles failed during this run");
        }

        code
    }
}

#[derive(Debug, thiserror::Error)]
enum ShutdownError {
    #[error("{activity} did not stop within {timeout:?}")]
    Timeout {
        activity: &'static str,
        timeout: Duration,
    },
    #[error("{activity} terminated abnormally: {source}")]
    Task {
        activity: &'static str,
        source: tokio::task::JoinError,
    },
}

async fn wait_for(
    activity: &'static str,
    handle: JoinHandle<()>,
    timeout: Duration,
) -> Result<(), ShutdownError> {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            debug!(activity, "stopped");
            Ok(())
        }
        Ok(Err(source)) => Err(ShutdownError::Task { activity, source }),
        Err(_) => Err(ShutdownError::Timeout { activity, timeout }),
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

// ============================================================
// Connection pool housekeeping
// ============================================================

async fn log_pool_stats(pool: ConnectionPool, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(POOL_STATS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let stats = PoolStats::of(&pool);
                debug!(
                    max_open = stats.max_open,
                    open = stats.open,
                    in_use = stats.in_use,
                    idle = stats.idle,
                    "db pool stats"
                );
            }
        }
    }
}

/// Releases the pool. A fetch still running on a blocking thread keeps its
/// connection until it finishes.
async fn close_pool(pool: ConnectionPool, timeout: Duration) {
    // Dropping postgres clients inside the runtime would panic.
    let closing = tokio::task::spawn_blocking(move || {
        let idle = pool.state().idle_connections;
        drop(pool);
        idle
    });
    match tokio::time::timeout(timeout, closing).await {
        Ok(Ok(idle)) => debug!(idle, "released database pool"),
        Ok(Err(e)) => warn!(error = %e, "failed to release database pool"),
        Err(_) => warn!("timed out releasing database pool"),
    }
}
