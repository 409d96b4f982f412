//! Errors raised while acquiring, validating and serving tokens

use std::{error, fmt, time::Duration};

use thiserror::Error;

use crate::GenerationState;

pub(crate) type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// The message returned to callers while no token has been promoted yet
pub const TOKEN_MINTER_NOT_READY_MESSAGE: &str = "Companion is starting. Please wait until a valid potoken is found. If this process takes too long, please consult: https://docs.invidious.io/youtube-errors-explained/#po-token-initialization-taking-too-much-time-to-complete";

/// The reason a generation failed
///
/// Every variant is terminal for the generation that raised it. Retrying is
/// the responsibility of whatever triggers the next generation.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The platform's session layer did not issue a visitor identity
    #[error("unable to obtain a visitor identity from the platform")]
    UpstreamUnavailable(#[source] BoxError),
    /// The challenge could not be fetched or was unusable
    #[error("unable to obtain a challenge")]
    ChallengeUnavailable(#[source] BoxError),
    /// The challenge script could not be loaded into the sandbox
    #[error(transparent)]
    SandboxLoad(#[from] SandboxLoadError),
    /// Solving the challenge did not produce an attestation
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    /// The platform refused to exchange the attestation for an integrity token
    #[error("attestation exchange was rejected: {reason}")]
    ExchangeRejected {
        /// Why the exchange was rejected
        reason: String,
        /// The underlying error, if any
        #[source]
        source: Option<BoxError>,
    },
    /// A minter could not be created or could not mint the session token
    #[error(transparent)]
    Mint(#[from] MintError),
    /// The freshly minted token was not accepted by the platform
    #[error("token validation failed")]
    ValidationFailed(#[from] ValidationError),
    /// A generation spent too long in a single state
    #[error("generation timed out after {after:?} while {state}")]
    Timeout {
        /// The state that did not complete in time
        state: GenerationState,
        /// The time allowed for the state
        after: Duration,
    },
    /// Too many generations are already in flight
    #[error("refusing to start a generation, {limit} already in flight")]
    InFlightLimit {
        /// The configured limit
        limit: usize,
    },
    /// The generation's worker stopped without reporting an outcome
    #[error("generation worker stopped before reporting an outcome")]
    Cancelled,
}

impl GenerationError {
    pub(crate) fn exchange_rejected(reason: impl Into<String>) -> Self {
        Self::ExchangeRejected {
            reason: reason.into(),
            source: None,
        }
    }

    /// A short, stable label for the kind of failure
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::ChallengeUnavailable(_) => "challenge_unavailable",
            Self::SandboxLoad(_) => "sandbox_load",
            Self::Attestation(_) => "attestation",
            Self::ExchangeRejected { .. } => "exchange_rejected",
            Self::Mint(_) => "mint",
            Self::ValidationFailed(_) => "validation_failed",
            Self::Timeout { .. } => "timeout",
            Self::InFlightLimit { .. } => "in_flight_limit",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The challenge script could not be loaded into the sandbox
#[derive(Debug, Error)]
pub enum SandboxLoadError {
    /// The sandbox thread could not be started
    #[error("unable to start sandbox thread")]
    Spawn(#[source] std::io::Error),
    /// The script threw while being evaluated
    #[error("script threw during load: {0}")]
    Threw(String),
    /// The script did not define the expected entry point
    #[error("script did not define entry point `{0}`")]
    MissingEntryPoint(String),
    /// The sandbox stopped before the script could be loaded
    #[error("sandbox is no longer running")]
    Gone,
}

/// Solving the challenge did not produce a usable attestation
#[derive(Debug, Error)]
pub enum AttestationError {
    /// The challenge program threw
    #[error("challenge program threw: {0}")]
    Threw(String),
    /// The challenge program completed without producing a response
    #[error("challenge program produced no attestation")]
    NoResponse,
    /// The challenge program did not populate its signal output
    #[error("challenge program produced no signal output")]
    NoSignal,
    /// The sandbox stopped while solving
    #[error("sandbox is no longer running")]
    Gone,
}

/// A token could not be minted
#[derive(Debug, Error)]
pub enum MintError {
    /// The integrity token was not valid base64
    #[error("integrity token is not valid base64")]
    InvalidIntegrityToken(#[source] base64::DecodeError),
    /// The signal output did not provide a minter
    #[error("signal output does not provide a minter: {0}")]
    NoMinter(String),
    /// The minter threw or produced unusable output
    #[error("minter failed: {0}")]
    Failed(String),
    /// The generation backing this minter has been retired
    #[error("generation backing this minter has been retired")]
    Retired,
}

/// The freshly minted token could not be shown to work
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The probe query could not be performed
    #[error("unable to query for validation candidates")]
    Search(#[source] PlatformError),
    /// The probe query returned nothing to validate against
    #[error("no validation candidates available")]
    NoCandidates,
    /// Every candidate attempted was rejected
    #[error("all {attempts} validation candidates were rejected; last cause: {last_cause}")]
    Exhausted {
        /// The number of candidates attempted
        attempts: usize,
        /// The last observed rejection
        last_cause: String,
    },
}

/// A request to the platform failed
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The request could not be completed
    #[error("request to platform failed")]
    Request(#[from] reqwest_middleware::Error),
    /// The response body could not be read
    #[error("unable to read platform response")]
    Body(#[from] reqwest::Error),
    /// The platform answered with an unexpected status
    #[error("platform responded with status {0}")]
    Status(u16),
    /// The video is not playable
    #[error("video is not playable ({status}): {reason}")]
    Unplayable {
        /// The platform's playability status
        status: String,
        /// The platform's explanation
        reason: String,
    },
    /// The response did not include a streamable resource
    #[error("no streamable resource in player response")]
    NoStream,
    /// The streaming URL was malformed
    #[error("malformed streaming URL: {0}")]
    MalformedUrl(String),
}

/// No generation has been promoted yet
///
/// This is a distinct, expected condition while the service is starting and
/// should be surfaced to callers as "try again later" rather than as a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotReady;

impl NotReady {
    /// The human-readable explanation and guidance for callers
    pub const fn message(&self) -> &'static str {
        TOKEN_MINTER_NOT_READY_MESSAGE
    }
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(TOKEN_MINTER_NOT_READY_MESSAGE)
    }
}

impl error::Error for NotReady {}

/// A content token could not be provided to a caller
#[derive(Debug, Error)]
pub enum ContentTokenError {
    /// No generation has been promoted yet
    #[error(transparent)]
    NotReady(#[from] NotReady),
    /// The current minter failed
    #[error(transparent)]
    Mint(#[from] MintError),
}

/// The orchestrator has stopped and no further generations will be promoted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Error)]
#[error("token orchestrator has stopped")]
pub struct OrchestratorStopped;
