//! Supervision of generations and promotion of the current minter

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use companion_reqwest::NetworkConfig;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    challenge::ChallengeSource,
    config::{GenerationConfig, SandboxLimits},
    metrics::GenerationMetrics,
    minter::Minter,
    platform::PlatformClient,
    protocol::{GenerationId, GenerationState, OrchestratorMessage, WorkerEvent},
    worker::{self, WorkerDeps},
    ContentToken, ContentTokenError, GenerationError, MintError, NotReady, OrchestratorStopped,
    PoToken, PoTokenRef, VideoIdRef, VisitorData, VisitorDataRef,
};

/// The outcome of a generation that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Renewal {
    /// The generation's minter is now current
    Promoted {
        /// The promoted generation
        generation: GenerationId,
    },
    /// A later generation was promoted first, so this one was retired
    Superseded {
        /// The retired generation
        generation: GenerationId,
        /// The generation that superseded it
        by: GenerationId,
    },
}

/// How many ended generations [`Orchestrator::generations`] remembers
const ENDED_GENERATIONS_KEPT: usize = 8;

/// A point-in-time view of a generation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationStatus {
    /// The generation
    pub generation: GenerationId,
    /// Its current state
    pub state: GenerationState,
    /// Time since the generation was started
    pub age: Duration,
}

/// The minter of a promoted generation together with its session
///
/// A handle stays usable after a newer generation has been promoted. The
/// sandbox behind it is shut down once the last handle is dropped.
#[derive(Debug)]
pub struct MinterHandle {
    generation: GenerationId,
    session: PoToken,
    visitor: VisitorData,
    minter: Minter,
    started: Instant,
    promoted_at: Instant,
}

impl MinterHandle {
    /// The generation that produced this minter
    #[inline]
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// The validated session token
    #[inline]
    pub fn session(&self) -> &PoTokenRef {
        &self.session
    }

    /// The visitor identity the session token was minted for
    #[inline]
    pub fn visitor(&self) -> &VisitorDataRef {
        &self.visitor
    }

    /// The minter
    #[inline]
    pub fn minter(&self) -> &Minter {
        &self.minter
    }

    /// When the generation was promoted
    #[inline]
    pub fn promoted_at(&self) -> Instant {
        self.promoted_at
    }
}

/// Read access to the current minter
///
/// Cheap to clone and safe to share among any number of request handlers.
/// Reads never block on renewal and never observe a minter older than one
/// they have already seen.
#[derive(Clone, Debug)]
pub struct TokenMinter {
    current: Arc<ArcSwapOption<MinterHandle>>,
    published: watch::Receiver<Option<GenerationId>>,
}

impl TokenMinter {
    /// The current minter, or [`NotReady`] if none has been promoted yet
    pub fn current(&self) -> Result<Arc<MinterHandle>, NotReady> {
        self.current.load_full().ok_or(NotReady)
    }

    /// Whether a minter has been promoted
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Mints a content token using the current minter
    ///
    /// Fails fast with [`NotReady`] before the first promotion. If the sandbox
    /// behind the loaded minter has stopped and a newer minter has been
    /// promoted meanwhile, the request is retried once against the newer one.
    pub async fn mint_content_token(
        &self,
        video_id: &VideoIdRef,
    ) -> Result<ContentToken, ContentTokenError> {
        let handle = self.current()?;
        match handle.minter.mint_content_token(video_id).await {
            Err(MintError::Retired) => {
                let latest = self.current()?;
                if latest.generation == handle.generation {
                    return Err(MintError::Retired.into());
                }
                Ok(latest.minter.mint_content_token(video_id).await?)
            }
            result => Ok(result?),
        }
    }

    /// Waits until a generation is promoted after the last one observed
    pub async fn changed(&mut self) -> Result<GenerationId, OrchestratorStopped> {
        loop {
            self.published
                .changed()
                .await
                .map_err(|_| OrchestratorStopped)?;
            if let Some(generation) = *self.published.borrow_and_update() {
                return Ok(generation);
            }
        }
    }
}

type RenewalReply = oneshot::Sender<Result<Renewal, GenerationError>>;

enum Command {
    Renew { reply: Option<RenewalReply> },
    Generations { reply: oneshot::Sender<Vec<GenerationStatus>> },
}

/// Configures and starts an [`Orchestrator`]
pub struct OrchestratorBuilder {
    challenge: Arc<dyn ChallengeSource>,
    platform: Arc<dyn PlatformClient>,
    config: GenerationConfig,
    limits: SandboxLimits,
    network: NetworkConfig,
    max_in_flight: usize,
    metrics: Arc<dyn GenerationMetrics>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("network", &self.network)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Sets the configuration snapshot handed to each new generation
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the resource bounds of each generation's sandbox
    pub fn with_sandbox_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the network policy of each sandbox's fetch capability
    pub fn with_network_config(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Sets how many generations may be acquiring at once
    ///
    /// Defaults to 2, which allows one renewal to race a slow one.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the sink generation outcomes are reported to
    pub fn with_metrics(mut self, metrics: impl GenerationMetrics) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// Starts the orchestrator on the current tokio runtime
    ///
    /// No generation is started until a renewal is requested.
    pub fn spawn(self) -> Orchestrator {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (supervisor, minter, event_rx) = self.into_supervisor();

        let join = tokio::spawn(supervisor.run(command_rx, event_rx));
        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("orchestrator panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("orchestrator was cancelled")
                }
            } else {
                tracing::info!("all orchestrator handles dropped")
            }
        });

        Orchestrator { commands, minter }
    }

    fn into_supervisor(self) -> (Supervisor, TokenMinter, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let current = Arc::new(ArcSwapOption::empty());
        let (published, published_rx) = watch::channel(None);

        let supervisor = Supervisor {
            deps: Arc::new(WorkerDeps {
                challenge: self.challenge,
                platform: self.platform,
                limits: self.limits,
                network: self.network,
            }),
            config: Arc::new(self.config),
            max_in_flight: self.max_in_flight,
            metrics: self.metrics,
            next_generation: 1,
            live: HashMap::new(),
            ended: VecDeque::with_capacity(ENDED_GENERATIONS_KEPT),
            events,
            current: current.clone(),
            published,
        };
        let minter = TokenMinter {
            current,
            published: published_rx,
        };

        (supervisor, minter, event_rx)
    }
}

/// Starts generations and promotes the first to prove itself
///
/// The orchestrator runs as a task that owns every generation. Handles to it
/// are cheap to clone; the task stops once every handle has been dropped,
/// although the [`TokenMinter`] keeps serving the last promoted minter.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    minter: TokenMinter,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Renew { .. } => f.write_str("Renew"),
            Self::Generations { .. } => f.write_str("Generations"),
        }
    }
}

impl Orchestrator {
    /// Starts configuring an orchestrator
    pub fn builder(
        challenge: impl ChallengeSource,
        platform: impl PlatformClient,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            challenge: Arc::new(challenge),
            platform: Arc::new(platform),
            config: GenerationConfig::default(),
            limits: SandboxLimits::default(),
            network: NetworkConfig::default(),
            max_in_flight: 2,
            metrics: Arc::new(()),
        }
    }

    /// Starts a new generation and waits for its outcome
    ///
    /// A failure never replaces a previously promoted minter.
    pub async fn renew(&self) -> Result<Renewal, GenerationError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Renew { reply: Some(reply) })
            .map_err(|_| GenerationError::Cancelled)?;
        rx.await.map_err(|_| GenerationError::Cancelled)?
    }

    /// Starts a new generation without waiting for it
    pub fn trigger_renewal(&self) {
        if self.commands.send(Command::Renew { reply: None }).is_err() {
            tracing::debug!("orchestrator stopped, ignoring renewal trigger");
        }
    }

    /// The live generations, the current one, and the most recently ended ones
    ///
    /// Generations that failed or were retired are reported as
    /// [`Failed`](GenerationState::Failed) or
    /// [`Retired`](GenerationState::Retired) until newer endings push them
    /// out. Statuses are ordered by generation.
    pub async fn generations(&self) -> Vec<GenerationStatus> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Generations { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Read access to the current minter
    pub fn minter(&self) -> TokenMinter {
        self.minter.clone()
    }
}

struct LiveGeneration {
    state: GenerationState,
    inbox: mpsc::UnboundedSender<OrchestratorMessage>,
    task: JoinHandle<()>,
    reply: Option<RenewalReply>,
    started: Instant,
}

impl LiveGeneration {
    fn resolve(&mut self, outcome: Result<Renewal, GenerationError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EndedGeneration {
    generation: GenerationId,
    state: GenerationState,
    started: Instant,
}

struct Supervisor {
    deps: Arc<WorkerDeps>,
    config: Arc<GenerationConfig>,
    max_in_flight: usize,
    metrics: Arc<dyn GenerationMetrics>,
    next_generation: u64,
    live: HashMap<GenerationId, LiveGeneration>,
    ended: VecDeque<EndedGeneration>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    current: Arc<ArcSwapOption<MinterHandle>>,
    published: watch::Sender<Option<GenerationId>>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        for (generation, mut live) in self.live.drain() {
            live.task.abort();
            live.resolve(Err(GenerationError::Cancelled));
            tracing::debug!(generation.id = %generation, "abandoned in-flight generation");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Renew { reply } => self.start_generation(reply),
            Command::Generations { reply } => {
                let now = Instant::now();
                let mut statuses: Vec<_> = self
                    .live
                    .iter()
                    .map(|(generation, live)| GenerationStatus {
                        generation: *generation,
                        state: live.state,
                        age: now.saturating_duration_since(live.started),
                    })
                    .collect();
                if let Some(current) = self.current.load_full() {
                    statuses.push(GenerationStatus {
                        generation: current.generation,
                        state: GenerationState::Ready,
                        age: now.saturating_duration_since(current.started),
                    });
                }
                statuses.extend(self.ended.iter().map(|ended| GenerationStatus {
                    generation: ended.generation,
                    state: ended.state,
                    age: now.saturating_duration_since(ended.started),
                }));
                statuses.sort_by_key(|s| s.generation);
                let _ = reply.send(statuses);
            }
        }
    }

    fn start_generation(&mut self, reply: Option<RenewalReply>) {
        if self.live.len() >= self.max_in_flight {
            tracing::debug!(
                in_flight = self.live.len(),
                "refusing renewal, too many generations in flight"
            );
            if let Some(reply) = reply {
                let _ = reply.send(Err(GenerationError::InFlightLimit {
                    limit: self.max_in_flight,
                }));
            }
            return;
        }

        let generation = GenerationId::new(self.next_generation);
        self.next_generation += 1;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("generation", generation.id = %generation);
        let task = tokio::spawn(
            worker::run(generation, self.deps.clone(), inbox_rx, self.events.clone())
                .instrument(span),
        );

        tracing::debug!(generation.id = %generation, "generation spawned");
        self.live.insert(
            generation,
            LiveGeneration {
                state: GenerationState::Spawned,
                inbox,
                task,
                reply,
                started: Instant::now(),
            },
        );
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let generation = event.generation();
        match event {
            WorkerEvent::Ready { .. } => {
                if let Some(live) = self.live.get(&generation) {
                    let message = OrchestratorMessage::Initialise(self.config.clone());
                    if live.inbox.send(message).is_err() {
                        tracing::debug!(generation.id = %generation, "worker gone before initialise");
                    }
                }
            }
            WorkerEvent::StateChanged { state, .. } => {
                if let Some(live) = self.live.get_mut(&generation) {
                    live.state = state;
                }
            }
            WorkerEvent::Initialised {
                session,
                visitor,
                minter,
                ..
            } => self.promote(generation, session, visitor, minter),
            WorkerEvent::Error { cause, .. } => self.fail(generation, cause),
        }
    }

    fn fail(&mut self, generation: GenerationId, cause: GenerationError) {
        let Some(mut live) = self.live.remove(&generation) else {
            // Already retired; its outcome no longer matters.
            return;
        };

        tracing::warn!(
            generation.id = %generation,
            generation.state = %live.state,
            error = (&cause as &dyn std::error::Error),
            "generation failed"
        );
        self.metrics.generation_failed(generation, &cause);
        live.task.abort();
        live.resolve(Err(cause));
        self.record_ended(generation, GenerationState::Failed, live.started);
    }

    fn record_ended(&mut self, generation: GenerationId, state: GenerationState, started: Instant) {
        if self.ended.len() == ENDED_GENERATIONS_KEPT {
            self.ended.pop_front();
        }
        self.ended.push_back(EndedGeneration {
            generation,
            state,
            started,
        });
    }

    fn promote(
        &mut self,
        generation: GenerationId,
        session: PoToken,
        visitor: VisitorData,
        minter: Minter,
    ) {
        // Every promotion drains the live set, so a generation that is no
        // longer live has been superseded and its minter was never published.
        let Some(mut live) = self.live.remove(&generation) else {
            minter.retire();
            tracing::debug!(generation.id = %generation, "discarding minter of retired generation");
            return;
        };

        let handle = Arc::new(MinterHandle {
            generation,
            session,
            visitor,
            minter,
            started: live.started,
            promoted_at: Instant::now(),
        });
        let previous = self.current.swap(Some(handle));
        self.published.send_replace(Some(generation));
        self.metrics.generation_promoted(generation);

        tracing::info!(
            generation.id = %generation,
            elapsed_ms = live.started.elapsed().as_millis() as u64,
            "generation promoted"
        );

        // Callers may still hold the previous handle; its sandbox stops when
        // the last of them lets go.
        if let Some(previous) = previous {
            self.record_ended(previous.generation, GenerationState::Retired, previous.started);
            tracing::info!(generation.id = %previous.generation, "previous generation retired");
        }

        let superseded: Vec<_> = self.live.drain().collect();
        for (other, mut retired) in superseded {
            retired.task.abort();
            retired.resolve(Ok(Renewal::Superseded {
                generation: other,
                by: generation,
            }));
            tracing::info!(
                generation.id = %other,
                generation.state = %retired.state,
                superseded_by = %generation,
                "in-flight generation retired"
            );
            self.record_ended(other, GenerationState::Retired, retired.started);
        }

        live.resolve(Ok(Renewal::Promoted { generation }));
    }
}
