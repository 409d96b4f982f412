//! The supervised task that drives a single generation

use std::{future::Future, sync::Arc};

use companion_reqwest::NetworkConfig;
use tokio::sync::mpsc;

use crate::{
    challenge::{self, ChallengeSource},
    config::{GenerationConfig, SandboxLimits},
    minter::Minter,
    platform::{PlatformClient, SessionContext},
    protocol::{GenerationId, GenerationState, OrchestratorMessage, WorkerEvent},
    sandbox::{SandboxEnv, SandboxHandle},
    validator, GenerationError, PoToken, VisitorData,
};

/// What every generation needs, shared across generations
pub(crate) struct WorkerDeps {
    pub(crate) challenge: Arc<dyn ChallengeSource>,
    pub(crate) platform: Arc<dyn PlatformClient>,
    pub(crate) limits: SandboxLimits,
    pub(crate) network: NetworkConfig,
}

impl std::fmt::Debug for WorkerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDeps")
            .field("limits", &self.limits)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

struct Acquired {
    session: PoToken,
    visitor: VisitorData,
    minter: Minter,
}

/// Reports [`GenerationError::Cancelled`] unless an outcome was reported
///
/// Covers a worker that panics or is aborted mid-flight.
struct OutcomeGuard {
    generation: GenerationId,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl OutcomeGuard {
    fn report(mut self, event: WorkerEvent) {
        if let Some(events) = self.events.take() {
            let _ = events.send(event);
        }
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(WorkerEvent::Error {
                generation: self.generation,
                cause: GenerationError::Cancelled,
            });
        }
    }
}

/// Runs one generation from sandbox boot to its terminal outcome
///
/// Emits `Ready` once the sandbox has booted, waits for `Initialise`, then
/// reports every state change followed by exactly one `Initialised` or
/// `Error`.
pub(crate) async fn run(
    generation: GenerationId,
    deps: Arc<WorkerDeps>,
    mut inbox: mpsc::UnboundedReceiver<OrchestratorMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let guard = OutcomeGuard {
        generation,
        events: Some(events.clone()),
    };

    let outcome = async {
        let (sandbox, outbox) =
            SandboxHandle::spawn(generation, deps.limits.clone(), deps.network.clone()).await?;
        let _ = events.send(WorkerEvent::Ready { generation });

        let config = match inbox.recv().await {
            Some(OrchestratorMessage::Initialise(config)) => config,
            None => return Err(GenerationError::Cancelled),
        };

        acquire(generation, &deps, &config, sandbox, outbox, &events).await
    }
    .await;

    let event = match outcome {
        Ok(acquired) => WorkerEvent::Initialised {
            generation,
            session: acquired.session,
            visitor: acquired.visitor,
            minter: acquired.minter,
        },
        Err(cause) => WorkerEvent::Error { generation, cause },
    };
    guard.report(event);
}

async fn acquire(
    generation: GenerationId,
    deps: &WorkerDeps,
    config: &GenerationConfig,
    sandbox: SandboxHandle,
    outbox: mpsc::UnboundedReceiver<crate::protocol::ContentTokenResponse>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> Result<Acquired, GenerationError> {
    let stage = |state| enter(generation, state, config, events);

    let visitor = stage(GenerationState::Initializing)
        .run(deps.challenge.fetch_visitor_identity())
        .await?;

    let integrity = stage(GenerationState::Challenging)
        .run(async {
            let challenge = deps
                .challenge
                .fetch_challenge(&visitor, config.request_key())
                .await?;
            let env = SandboxEnv {
                visitor: visitor.clone(),
                request_key: config.request_key().to_owned(),
            };
            let attestation = challenge::solve(challenge, &sandbox, env).await?;
            deps.challenge
                .exchange(&attestation, config.request_key())
                .await
        })
        .await?;

    let (minter, session) = stage(GenerationState::Minting)
        .run(async {
            let minter = Minter::create(sandbox, outbox, &integrity.integrity_token).await?;
            let session = minter.mint_session(&visitor).await?;
            Ok((minter, session))
        })
        .await?;

    let session_context = SessionContext {
        po_token: session.clone(),
        visitor: visitor.clone(),
    };
    stage(GenerationState::Validating)
        .run(async {
            validator::validate(
                deps.platform.as_ref(),
                &minter,
                &session_context,
                config.validation_query(),
                config.validation_attempts(),
            )
            .await
            .map_err(GenerationError::from)
        })
        .await?;

    Ok(Acquired {
        session,
        visitor,
        minter,
    })
}

struct Stage<'a> {
    generation: GenerationId,
    state: GenerationState,
    config: &'a GenerationConfig,
}

fn enter<'a>(
    generation: GenerationId,
    state: GenerationState,
    config: &'a GenerationConfig,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> Stage<'a> {
    tracing::debug!(generation.id = %generation, generation.state = %state, "entering state");
    let _ = events.send(WorkerEvent::StateChanged { generation, state });
    Stage {
        generation,
        state,
        config,
    }
}

impl Stage<'_> {
    async fn run<T, F>(self, work: F) -> Result<T, GenerationError>
    where
        F: Future<Output = Result<T, GenerationError>>,
    {
        let Some(after) = self.config.timeouts().for_state(self.state) else {
            return work.await;
        };

        match tokio::time::timeout(after, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    generation.id = %self.generation,
                    generation.state = %self.state,
                    timeout_ms = after.as_millis() as u64,
                    "state timed out"
                );
                Err(GenerationError::Timeout {
                    state: self.state,
                    after,
                })
            }
        }
    }
}
