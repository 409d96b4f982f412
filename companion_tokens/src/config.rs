//! Configuration snapshots handed to each generation

use std::time::Duration;

use crate::{GenerationState, RequestKey};

/// The request key used by the platform's web client
pub const DEFAULT_REQUEST_KEY: &str = "O43z0dpjhgX20SCx4KAo";

/// Settings that apply to a single generation
///
/// A snapshot of this configuration is sent to each worker when it is
/// initialised, so changing the orchestrator's configuration never affects a
/// generation that is already in flight.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    request_key: RequestKey,
    validation_query: String,
    validation_attempts: usize,
    timeouts: StageTimeouts,
}

impl Default for GenerationConfig {
    /// Default generation configuration
    ///
    /// Uses the web client's request key, validates against up to 3 results of
    /// a `"news"` search, and uses [`StageTimeouts::default()`].
    fn default() -> Self {
        Self {
            request_key: RequestKey::from_static(DEFAULT_REQUEST_KEY),
            validation_query: "news".to_owned(),
            validation_attempts: 3,
            timeouts: StageTimeouts::default(),
        }
    }
}

impl GenerationConfig {
    /// Sets the request key presented to the challenge endpoints
    pub fn with_request_key(mut self, request_key: RequestKey) -> Self {
        self.request_key = request_key;
        self
    }

    /// Sets the search query used to find validation candidates
    pub fn with_validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = query.into();
        self
    }

    /// Sets how many candidates validation may try before giving up
    pub fn with_validation_attempts(mut self, attempts: usize) -> Self {
        self.validation_attempts = attempts.max(1);
        self
    }

    /// Sets the time allowed in each state
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The request key presented to the challenge endpoints
    #[inline]
    pub fn request_key(&self) -> &crate::RequestKeyRef {
        &self.request_key
    }

    /// The search query used to find validation candidates
    #[inline]
    pub fn validation_query(&self) -> &str {
        &self.validation_query
    }

    /// The maximum number of candidates validation will try
    #[inline]
    pub fn validation_attempts(&self) -> usize {
        self.validation_attempts
    }

    /// The time allowed in each state
    #[inline]
    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }
}

/// How long a generation may remain in each non-terminal state
///
/// A generation that exceeds the allowance for its current state fails with
/// [`GenerationError::Timeout`](crate::GenerationError::Timeout).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Time allowed to obtain a visitor identity
    pub initializing: Duration,
    /// Time allowed to fetch, solve and exchange the challenge
    pub challenging: Duration,
    /// Time allowed to create the minter and mint the session token
    pub minting: Duration,
    /// Time allowed for validation, across all candidates
    pub validating: Duration,
}

impl Default for StageTimeouts {
    /// 15 s to initialise, 30 s to challenge, 10 s to mint, 60 s to validate
    fn default() -> Self {
        Self {
            initializing: Duration::from_secs(15),
            challenging: Duration::from_secs(30),
            minting: Duration::from_secs(10),
            validating: Duration::from_secs(60),
        }
    }
}

impl StageTimeouts {
    /// Uses the same allowance for every state
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            initializing: timeout,
            challenging: timeout,
            minting: timeout,
            validating: timeout,
        }
    }

    /// The allowance for `state`, if it is one that can time out
    pub fn for_state(&self, state: GenerationState) -> Option<Duration> {
        match state {
            GenerationState::Initializing => Some(self.initializing),
            GenerationState::Challenging => Some(self.challenging),
            GenerationState::Minting => Some(self.minting),
            GenerationState::Validating => Some(self.validating),
            _ => None,
        }
    }
}

/// Resource bounds and environment for the script sandbox
///
/// The loop iteration limit is counted per function call: every loop in one
/// call shares the allowance, but each new call starts afresh. A script that
/// spreads its work over many calls is bounded only by the generation's state
/// timeouts. When a state times out, its sandbox thread is released once the
/// evaluation in progress returns, so a low limit also bounds how long a
/// timed-out generation keeps its thread busy.
#[derive(Clone, Debug)]
pub struct SandboxLimits {
    loop_iteration_limit: u64,
    recursion_limit: usize,
    user_agent: String,
    allow_fetch: bool,
}

impl Default for SandboxLimits {
    /// Default sandbox limits
    ///
    /// Allows 10 million loop iterations per call and a recursion depth
    /// of 2048, presents the default browser user agent, and enables the
    /// sandbox's fetch capability.
    fn default() -> Self {
        Self {
            loop_iteration_limit: 10_000_000,
            recursion_limit: 2048,
            user_agent: companion_reqwest::DEFAULT_USER_AGENT.to_owned(),
            allow_fetch: true,
        }
    }
}

impl SandboxLimits {
    /// Sets the maximum number of loop iterations a single call may run
    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    /// Sets the maximum call depth
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Sets the user agent exposed to scripts through `navigator`
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Enables or disables the fetch capability exposed to scripts
    pub fn with_fetch(mut self, allow_fetch: bool) -> Self {
        self.allow_fetch = allow_fetch;
        self
    }

    /// The maximum number of loop iterations per call
    #[inline]
    pub fn loop_iteration_limit(&self) -> u64 {
        self.loop_iteration_limit
    }

    /// The maximum call depth
    #[inline]
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    /// The user agent exposed to scripts
    #[inline]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Whether scripts may issue network requests
    #[inline]
    pub fn allow_fetch(&self) -> bool {
        self.allow_fetch
    }
}
