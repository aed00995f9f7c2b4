//! Poll loop: fetch, parse and publish the component directory on a timer.
//!
//! The loop alternates between waiting on its timer and running one cycle
//! (fetch + parse on the blocking pool, then publish). A successful cycle
//! re-arms the timer with the steady interval, a failed one with the shorter
//! backoff interval and leaves the published document untouched. The loop ends
//! only when its cancellation token fires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::fetcher::{Fetch, FetchError};
use crate::model::Document;
use crate::parser::{self, ParseError};
use crate::snapshot::DocumentSink;

/// Default poll period after a successful cycle.
pub const DEFAULT_STEADY_INTERVAL: Duration = Duration::from_secs(60);

/// Default poll period after a failed cycle.
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_secs(3);

/// Timer settings of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub steady_interval: Duration,
    pub backoff_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            steady_interval: DEFAULT_STEADY_INTERVAL,
            backoff_interval: DEFAULT_BACKOFF_INTERVAL,
        }
    }
}

/// A failed poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The blocking fetch task panicked or was aborted.
    #[error("fetch task failed: {0}")]
    Task(String),
}

/// Result of a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new document was published.
    Published,
    /// A new document was published after one or more failed cycles.
    Recovered,
    /// Fetch or parse failed; nothing was published.
    Failed,
}

/// Periodic fetch → parse → publish driver.
pub struct PollLoop {
    fetcher: Arc<dyn Fetch>,
    sink: Arc<dyn DocumentSink>,
    config: PollConfig,
    observer: Option<mpsc::Sender<PollError>>,
    /// Whether the previous cycle failed.
    failing: bool,
}

impl PollLoop {
    pub fn new(fetcher: Arc<dyn Fetch>, sink: Arc<dyn DocumentSink>, config: PollConfig) -> Self {
        Self {
            fetcher,
            sink,
            config,
            observer: None,
            failing: false,
        }
    }

    /// Reports every failed cycle to `observer`.
    ///
    /// Reporting never blocks the loop: errors are dropped while the channel
    /// is full or closed.
    pub fn with_observer(mut self, observer: mpsc::Sender<PollError>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs until `cancel` fires. The first cycle starts immediately.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            steady_secs = self.config.steady_interval.as_secs(),
            backoff_secs = self.config.backoff_interval.as_secs(),
            "starting CD poll loop"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.cycle() => outcome,
            };
            delay = self.next_delay(outcome);
        }

        info!("shutting down CD poll loop");
    }

    /// Runs one fetch + parse cycle and publishes the result on success.
    pub async fn cycle(&mut self) -> CycleOutcome {
        let fetcher = self.fetcher.clone();
        let t0 = Instant::now();
        let result = tokio::task::spawn_blocking(move || -> Result<Document, PollError> {
            let content = fetcher.fetch()?;
            Ok(parser::parse(&content)?)
        })
        .await
        .unwrap_or_else(|e| Err(PollError::Task(e.to_string())));
        let duration_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(document) => {
                let recovered = std::mem::replace(&mut self.failing, false);
                let components = document.component_count();
                let content_id = document.metadata.content_id;
                if recovered {
                    info!(components, content_id, duration_ms, "parsed CD content, recovered");
                } else {
                    debug!(components, content_id, duration_ms, "parsed CD content");
                }
                self.sink.publish(document);
                if recovered {
                    CycleOutcome::Recovered
                } else {
                    CycleOutcome::Published
                }
            }
            Err(e) => {
                match &e {
                    PollError::Fetch(err) => {
                        error!(error = %err, duration_ms, "failed reading CD content from database")
                    }
                    PollError::Parse(err) => {
                        error!(error = %err, duration_ms, "failed parsing CD content")
                    }
                    PollError::Task(err) => error!(error = %err, "CD fetch task failed"),
                }
                self.failing = true;
                self.report(e);
                CycleOutcome::Failed
            }
        }
    }

    /// Delay before the next cycle given the outcome of the previous one.
    pub fn next_delay(&self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Published | CycleOutcome::Recovered => self.config.steady_interval,
            CycleOutcome::Failed => self.config.backoff_interval,
        }
    }

    fn report(&self, err: PollError) {
        let Some(observer) = &self.observer else {
            return;
        };
        match observer.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("poll error observer is full, dropping error"),
            Err(TrySendError::Closed(_)) => debug!("poll error observer is gone, dropping error"),
        }
    }
}
