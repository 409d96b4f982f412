//! Periodic renewal of the current generation

use std::{error, time::Duration};

use companion_reqwest::backoff::{ErrorBackoffConfig, ErrorBackoffHandler};
use tokio::task::JoinHandle;

use crate::{jitter::JitterSource, GenerationError, Orchestrator, Renewal};

/// The default time between renewals
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Triggers renewals on a fixed, jittered interval
///
/// The first renewal starts immediately. A failed renewal is retried sooner
/// than the interval, backing off between attempts, until the backoff
/// attempts are used up.
#[derive(Debug)]
pub struct RenewalSchedule {
    task: JoinHandle<()>,
}

impl RenewalSchedule {
    /// Starts renewing on the current tokio runtime
    pub fn spawn<J>(orchestrator: Orchestrator, interval: Duration, jitter: J) -> Self
    where
        J: JitterSource + Send + 'static,
    {
        Self::spawn_with_backoff(orchestrator, interval, jitter, ErrorBackoffConfig::default())
    }

    /// Starts renewing, backing off from failures as configured
    pub fn spawn_with_backoff<J>(
        orchestrator: Orchestrator,
        interval: Duration,
        jitter: J,
        backoff: ErrorBackoffConfig,
    ) -> Self
    where
        J: JitterSource + Send + 'static,
    {
        let join = tokio::spawn(forever_renew(orchestrator, interval, jitter, backoff));
        let task = tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("renewal schedule panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("renewal schedule was stopped")
                }
            }
        });

        Self { task }
    }

    /// Stops renewing
    ///
    /// The orchestrator and the current minter are unaffected.
    pub fn stop(self) {
        self.task.abort();
    }
}

async fn forever_renew<J>(
    orchestrator: Orchestrator,
    interval: Duration,
    mut jitter_source: J,
    backoff_config: ErrorBackoffConfig,
) where
    J: JitterSource,
{
    let mut backoff_handler = ErrorBackoffHandler::new(backoff_config);

    loop {
        tracing::debug!("requesting renewal");
        let delay = match orchestrator.renew().await {
            Ok(Renewal::Promoted { generation }) => {
                backoff_handler.success();
                tracing::info!(generation.id = %generation, "renewal promoted");
                jitter_source.jitter(interval)
            }
            Ok(Renewal::Superseded { generation, by }) => {
                backoff_handler.success();
                tracing::debug!(generation.id = %generation, superseded_by = %by, "renewal superseded");
                jitter_source.jitter(interval)
            }
            Err(GenerationError::InFlightLimit { limit }) => {
                tracing::debug!(limit, "renewal skipped, generations already in flight");
                jitter_source.jitter(interval)
            }
            Err(error) => match backoff_handler.error() {
                Some(delay) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        delay_ms = delay.as_millis() as u64,
                        attempts = backoff_handler.attempts(),
                        "renewal failed, will retry"
                    );
                    delay
                }
                None => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        attempts = backoff_handler.attempts(),
                        "renewal failed, waiting for next interval"
                    );
                    backoff_handler.success();
                    jitter_source.jitter(interval)
                }
            },
        };

        tokio::time::sleep(delay).await;
    }
}
