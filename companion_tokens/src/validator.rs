//! Proving a freshly minted token against live traffic
//!
//! A token that the platform mints without complaint may still be rejected
//! when it is used, so a generation is only promoted once its token has
//! unlocked a real stream.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::{
    minter::Minter,
    platform::{with_query_param, PlatformClient, SessionContext},
    PlatformError, ValidationError, VideoId,
};

/// Validates `session` by streaming one of the results of `query`
///
/// The search results are shuffled so that no single video the platform may
/// single out is always chosen, and at most `max_attempts` distinct videos are
/// tried. Validation succeeds on the first stream that answers with `200`.
pub(crate) async fn validate(
    platform: &dyn PlatformClient,
    minter: &Minter,
    session: &SessionContext,
    query: &str,
    max_attempts: usize,
) -> Result<(), ValidationError> {
    let found = platform
        .search(query)
        .await
        .map_err(ValidationError::Search)?;

    let mut candidates = distinct(found);
    if candidates.is_empty() {
        return Err(ValidationError::NoCandidates);
    }

    {
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
    }
    candidates.truncate(max_attempts.max(1));

    let mut last_cause = String::new();
    for (attempt, video_id) in candidates.iter().enumerate() {
        match probe_candidate(platform, minter, session, video_id).await {
            Ok(()) => {
                tracing::debug!(
                    video.id = %video_id,
                    attempt = attempt + 1,
                    "token accepted by platform"
                );
                return Ok(());
            }
            Err(cause) => {
                tracing::debug!(
                    video.id = %video_id,
                    attempt = attempt + 1,
                    cause = %cause,
                    "validation candidate rejected"
                );
                last_cause = cause;
            }
        }
    }

    Err(ValidationError::Exhausted {
        attempts: candidates.len(),
        last_cause,
    })
}

fn distinct(found: Vec<VideoId>) -> Vec<VideoId> {
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

async fn probe_candidate(
    platform: &dyn PlatformClient,
    minter: &Minter,
    session: &SessionContext,
    video_id: &VideoId,
) -> Result<(), String> {
    let content_token = minter
        .mint_content_token(video_id)
        .await
        .map_err(|err| err.to_string())?;

    let url = platform
        .streaming_url(video_id, session)
        .await
        .map_err(|err| err.to_string())?;
    let url = with_query_param(&url, "pot", content_token.as_str()).map_err(|err| err.to_string())?;

    match platform.probe(&url).await {
        Ok(200) => Ok(()),
        Ok(status) => Err(PlatformError::Status(status).to_string()),
        Err(err) => Err(err.to_string()),
    }
}
