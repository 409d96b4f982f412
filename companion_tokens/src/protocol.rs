//! Identifiers and messages exchanged between the orchestrator, generation
//! workers and their sandboxes

use std::{fmt, sync::Arc};

use crate::{
    config::GenerationConfig, minter::Minter, ContentToken, GenerationError, MintError, PoToken,
    VideoId, VisitorData,
};

/// Identifies one end-to-end attempt to acquire a usable token
///
/// Identifiers are allocated from a monotonic counter, so a larger identifier
/// always denotes a generation that was started later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The numeric value of the identifier
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The lifecycle state of a generation
///
/// ```text
/// Spawned → Initializing → Challenging → Minting → Validating → Ready → Retired
///                 ↘              ↘            ↘           ↘
///                                    Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenerationState {
    /// The worker has been spawned but has not been initialised
    Spawned,
    /// Obtaining a visitor identity
    Initializing,
    /// Fetching, solving and exchanging the challenge
    Challenging,
    /// Creating the minter and minting the session token
    Minting,
    /// Proving the session token against live traffic
    Validating,
    /// The generation's minter has been promoted
    Ready,
    /// The generation failed and has been discarded
    Failed,
    /// The generation was superseded by a later one
    Retired,
}

impl GenerationState {
    /// Whether no further transitions can occur from this state
    ///
    /// `Ready` is terminal-success for the acquisition but can still be
    /// retired, so it is not considered terminal here.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Retired)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Initializing => "initializing",
            Self::Challenging => "challenging",
            Self::Minting => "minting",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlates a content-token request with its response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RequestId(u64);

impl RequestId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Orchestrator → worker
#[derive(Debug)]
pub(crate) enum OrchestratorMessage {
    /// Start acquiring a token with this configuration snapshot
    Initialise(Arc<GenerationConfig>),
}

/// Worker → orchestrator
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// The sandbox has booted and the worker awaits `Initialise`
    Ready { generation: GenerationId },
    /// The worker moved to a new non-terminal state
    StateChanged {
        generation: GenerationId,
        state: GenerationState,
    },
    /// The generation produced a validated session token
    Initialised {
        generation: GenerationId,
        session: PoToken,
        visitor: VisitorData,
        minter: Minter,
    },
    /// The generation failed
    Error {
        generation: GenerationId,
        cause: GenerationError,
    },
}

impl WorkerEvent {
    pub(crate) fn generation(&self) -> GenerationId {
        match self {
            Self::Ready { generation }
            | Self::StateChanged { generation, .. }
            | Self::Initialised { generation, .. }
            | Self::Error { generation, .. } => *generation,
        }
    }
}

/// Caller → sandbox
#[derive(Debug)]
pub(crate) struct ContentTokenRequest {
    pub(crate) video_id: VideoId,
    pub(crate) request_id: RequestId,
}

/// Sandbox → caller
#[derive(Debug)]
pub(crate) struct ContentTokenResponse {
    pub(crate) request_id: RequestId,
    pub(crate) result: Result<ContentToken, MintError>,
}
