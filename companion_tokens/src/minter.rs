//! Per-generation token minting

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    challenge::dto::integrity_token_bytes,
    protocol::{ContentTokenRequest, ContentTokenResponse, GenerationId, RequestId},
    sandbox::SandboxHandle,
    ContentToken, IntegrityTokenRef, MintError, PoToken, VideoIdRef, VisitorDataRef,
};

type Waiter = oneshot::Sender<Result<ContentToken, MintError>>;

#[derive(Debug, Default)]
struct Pending {
    closed: bool,
    waiting: HashMap<RequestId, Waiter>,
}

#[derive(Debug)]
struct Shared {
    generation: GenerationId,
    sandbox: SandboxHandle,
    pending: Mutex<Pending>,
    next_request: AtomicU64,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mints tokens using a generation's solved challenge
///
/// Many callers may mint concurrently through clones of the same minter. Every
/// request carries a unique identifier, and responses are routed back to the
/// caller that issued the matching request.
///
/// Minting is a deterministic function of the generation's integrity token and
/// the identifier being minted for.
#[derive(Clone, Debug)]
pub struct Minter {
    shared: Arc<Shared>,
}

impl Minter {
    /// Creates the minter inside `sandbox` and starts routing its responses
    pub(crate) async fn create(
        sandbox: SandboxHandle,
        outbox: mpsc::UnboundedReceiver<ContentTokenResponse>,
        integrity_token: &IntegrityTokenRef,
    ) -> Result<Self, MintError> {
        let bytes =
            integrity_token_bytes(integrity_token.as_str()).map_err(MintError::InvalidIntegrityToken)?;
        sandbox.create_minter(bytes).await?;

        let shared = Arc::new(Shared {
            generation: sandbox.generation(),
            sandbox,
            pending: Mutex::new(Pending::default()),
            next_request: AtomicU64::new(1),
        });

        tokio::spawn(route_responses(Arc::downgrade(&shared), outbox));

        Ok(Self { shared })
    }

    /// The generation this minter belongs to
    #[inline]
    pub fn generation(&self) -> GenerationId {
        self.shared.generation
    }

    /// Mints the session-wide token for a visitor identity
    pub(crate) async fn mint_session(&self, visitor: &VisitorDataRef) -> Result<PoToken, MintError> {
        self.shared.sandbox.mint_session(visitor).await
    }

    /// Mints a token bound to `video_id`
    ///
    /// Returns [`MintError::Retired`] if the generation's sandbox has already
    /// been shut down. Requests queued before shutdown still complete.
    pub async fn mint_content_token(
        &self,
        video_id: &VideoIdRef,
    ) -> Result<ContentToken, MintError> {
        let request_id = RequestId::new(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.lock_pending();
            if pending.closed {
                return Err(MintError::Retired);
            }
            pending.waiting.insert(request_id, tx);
        }
        let _abandon = AbandonOnDrop {
            shared: &self.shared,
            request_id,
        };

        self.shared
            .sandbox
            .request_content_token(ContentTokenRequest {
                video_id: video_id.to_owned(),
                request_id,
            })?;

        rx.await.map_err(|_| MintError::Retired)?
    }

    /// Shuts down the sandbox backing this minter
    pub(crate) fn retire(&self) {
        self.shared.sandbox.shutdown();
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.shared.lock_pending().waiting.len()
    }
}

/// Forgets a request whose caller stopped waiting
struct AbandonOnDrop<'a> {
    shared: &'a Shared,
    request_id: RequestId,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().waiting.remove(&self.request_id);
    }
}

async fn route_responses(
    shared: Weak<Shared>,
    mut outbox: mpsc::UnboundedReceiver<ContentTokenResponse>,
) {
    while let Some(response) = outbox.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let waiter = shared.lock_pending().waiting.remove(&response.request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response.result);
            }
            None => tracing::trace!(
                request.id = %response.request_id,
                "dropping content token for abandoned request"
            ),
        }
    }

    if let Some(shared) = shared.upgrade() {
        let mut pending = shared.lock_pending();
        pending.closed = true;
        pending.waiting.clear();
        tracing::debug!(generation.id = %shared.generation, "minter closed");
    }
}
