//! Axum utilities for serving proof-of-origin tokens from request handlers
//!
//! Handlers extract the [`CurrentMinter`] and mint through it. While no
//! generation has been promoted yet, extraction is rejected with a
//! `503 Service Unavailable` explaining that the service is still starting,
//! rather than with a generic failure.
//!
//! # Example
//!
//! ```no_run
//! use axum::{extract::Path, routing::get, Router};
//! use companion_axum::{CurrentMinter, MintRejection};
//! use companion_tokens::TokenMinter;
//!
//! async fn content_token(
//!     CurrentMinter(handle): CurrentMinter,
//!     Path(video_id): Path<String>,
//! ) -> Result<String, MintRejection> {
//!     let token = companion_axum::mint_with(&handle, &video_id).await?;
//!     Ok(token.take())
//! }
//!
//! fn router(minter: TokenMinter) -> Router {
//!     Router::new()
//!         .route("/token/:video_id", get(content_token))
//!         .with_state(minter)
//! }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{error::Error, fmt, sync::Arc};

use axum_core::{
    extract::{FromRef, FromRequestParts},
    response::{IntoResponse, Response},
};
use companion_tokens::{
    ContentToken, ContentTokenError, InvalidVideoId, MintError, MinterHandle, NotReady,
    TokenMinter, VideoId,
};
use http::{header, request::Parts, StatusCode};

/// The message returned when a video identifier is malformed
pub const INVALID_VIDEO_ID_MESSAGE: &str = "Invalid video ID format.";

/// The reason a token could not be served
#[derive(Debug)]
#[non_exhaustive]
pub enum MintRejection {
    /// No generation has been promoted yet
    NotReady,
    /// The requested video identifier is malformed
    InvalidVideoId(InvalidVideoId),
    /// The current minter failed
    MintFailed(MintError),
}

impl fmt::Display for MintRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => fmt::Display::fmt(&NotReady, f),
            Self::InvalidVideoId(_) => f.write_str(INVALID_VIDEO_ID_MESSAGE),
            Self::MintFailed(_) => f.write_str("unable to mint token"),
        }
    }
}

impl Error for MintRejection {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotReady => None,
            Self::InvalidVideoId(err) => Some(err),
            Self::MintFailed(err) => Some(err),
        }
    }
}

impl From<NotReady> for MintRejection {
    fn from(_: NotReady) -> Self {
        Self::NotReady
    }
}

impl From<InvalidVideoId> for MintRejection {
    fn from(err: InvalidVideoId) -> Self {
        Self::InvalidVideoId(err)
    }
}

impl From<MintError> for MintRejection {
    fn from(err: MintError) -> Self {
        Self::MintFailed(err)
    }
}

impl From<ContentTokenError> for MintRejection {
    fn from(err: ContentTokenError) -> Self {
        match err {
            ContentTokenError::NotReady(_) => Self::NotReady,
            ContentTokenError::Mint(err) => Self::MintFailed(err),
        }
    }
}

impl IntoResponse for MintRejection {
    fn into_response(self) -> Response {
        match self {
            MintRejection::NotReady => {
                let body = serde_json::json!({
                    "error": NotReady.message(),
                    "status": "SERVICE_UNAVAILABLE",
                });
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::CONTENT_TYPE, "application/json")],
                    body.to_string(),
                )
                    .into_response()
            }
            MintRejection::InvalidVideoId(_) => {
                (StatusCode::BAD_REQUEST, INVALID_VIDEO_ID_MESSAGE).into_response()
            }
            MintRejection::MintFailed(err) => {
                tracing::warn!(error = (&err as &dyn Error), "failed to mint content token");
                (StatusCode::INTERNAL_SERVER_ERROR, "unable to mint token").into_response()
            }
        }
    }
}

/// The current minter, extracted from a [`TokenMinter`] in the router state
///
/// Rejects with [`MintRejection::NotReady`] until the first promotion. The
/// handle stays usable for the rest of the request even if a newer
/// generation is promoted meanwhile.
#[derive(Clone, Debug)]
pub struct CurrentMinter(pub Arc<MinterHandle>);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for CurrentMinter
where
    TokenMinter: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = MintRejection;

    async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let minter = TokenMinter::from_ref(state);
        Ok(Self(minter.current()?))
    }
}

/// Validates `raw_video_id` and mints a content token for it with `handle`
pub async fn mint_with(
    handle: &MinterHandle,
    raw_video_id: &str,
) -> Result<ContentToken, MintRejection> {
    let video_id = VideoId::new(raw_video_id.to_owned())?;
    Ok(handle.minter().mint_content_token(&video_id).await?)
}

/// Validates `raw_video_id` and mints a content token with the current minter
///
/// Unlike [`mint_with`], a request whose minter stopped mid-request is retried
/// once on the newer minter.
pub async fn mint_current(
    minter: &TokenMinter,
    raw_video_id: &str,
) -> Result<ContentToken, MintRejection> {
    let video_id = VideoId::new(raw_video_id.to_owned())?;
    Ok(minter.mint_content_token(&video_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        extract::{Path, State},
        http::Request,
        routing::get,
        Router,
    };
    use companion_tokens::{
        challenge::{Challenge, ChallengeSource, IntegrityTokenResponse},
        platform::{PlatformClient, SessionContext},
        AttestationRef, GenerationError, Orchestrator, PlatformError, RequestKeyRef, VideoIdRef,
        VisitorData, VisitorDataRef,
    };
    use tower::ServiceExt;

    struct Unreachable;

    #[async_trait]
    impl ChallengeSource for Unreachable {
        async fn fetch_visitor_identity(&self) -> Result<VisitorData, GenerationError> {
            Err(GenerationError::UpstreamUnavailable("offline".into()))
        }

        async fn fetch_challenge(
            &self,
            _: &VisitorDataRef,
            _: &RequestKeyRef,
        ) -> Result<Challenge, GenerationError> {
            Err(GenerationError::ChallengeUnavailable("offline".into()))
        }

        async fn exchange(
            &self,
            _: &AttestationRef,
            _: &RequestKeyRef,
        ) -> Result<IntegrityTokenResponse, GenerationError> {
            Err(GenerationError::Cancelled)
        }
    }

    #[async_trait]
    impl PlatformClient for Unreachable {
        async fn search(&self, _: &str) -> Result<Vec<VideoId>, PlatformError> {
            Err(PlatformError::Status(503))
        }

        async fn streaming_url(
            &self,
            _: &VideoIdRef,
            _: &SessionContext,
        ) -> Result<String, PlatformError> {
            Err(PlatformError::NoStream)
        }

        async fn probe(&self, _: &str) -> Result<u16, PlatformError> {
            Err(PlatformError::Status(503))
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    mod when_rendering_rejections {
        use super::*;

        #[tokio::test]
        async fn not_ready_is_service_unavailable_with_guidance() {
            let response = MintRejection::NotReady.into_response();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(
                response.headers()[header::CONTENT_TYPE],
                "application/json"
            );

            let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
            assert_eq!(body["status"], "SERVICE_UNAVAILABLE");
            assert_eq!(
                body["error"],
                companion_tokens::TOKEN_MINTER_NOT_READY_MESSAGE
            );
        }

        #[tokio::test]
        async fn invalid_video_id_is_bad_request() {
            let rejection = VideoId::new("too-short".to_owned())
                .map_err(MintRejection::from)
                .unwrap_err();
            let response = rejection.into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_text(response).await, INVALID_VIDEO_ID_MESSAGE);
        }

        #[tokio::test]
        async fn mint_failure_is_internal_error() {
            let response = MintRejection::from(MintError::Retired).into_response();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        #[test]
        fn content_token_errors_map_to_rejections() {
            assert!(matches!(
                MintRejection::from(ContentTokenError::NotReady(NotReady)),
                MintRejection::NotReady
            ));
            assert!(matches!(
                MintRejection::from(ContentTokenError::Mint(MintError::Retired)),
                MintRejection::MintFailed(MintError::Retired)
            ));
        }
    }

    mod when_serving_before_promotion {
        use super::*;

        async fn content_token(
            CurrentMinter(handle): CurrentMinter,
            Path(video_id): Path<String>,
        ) -> Result<String, MintRejection> {
            Ok(mint_with(&handle, &video_id).await?.take())
        }

        async fn content_token_current(
            State(minter): State<TokenMinter>,
            Path(video_id): Path<String>,
        ) -> Result<String, MintRejection> {
            Ok(mint_current(&minter, &video_id).await?.take())
        }

        fn router() -> Router {
            let orchestrator = Orchestrator::builder(Unreachable, Unreachable).spawn();
            Router::new()
                .route("/token/:video_id", get(content_token))
                .route("/current/:video_id", get(content_token_current))
                .with_state(orchestrator.minter())
        }

        fn request(uri: &str) -> Request<Body> {
            Request::builder().uri(uri).body(Body::empty()).unwrap()
        }

        #[tokio::test]
        async fn extractor_rejects_as_not_ready() {
            let response = router()
                .oneshot(request("/token/dQw4w9WgXcQ"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }

        #[tokio::test]
        async fn invalid_id_is_rejected_before_readiness() {
            let response = router()
                .oneshot(request("/current/not-an-id"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn valid_id_is_not_ready() {
            let response = router()
                .oneshot(request("/current/dQw4w9WgXcQ"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
