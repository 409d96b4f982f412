//! The platform calls used to prove a token against live traffic

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};

use crate::{PlatformError, PoToken, VideoId, VideoIdRef, VisitorData};

/// The web client version presented to the platform
pub const WEB_CLIENT_VERSION: &str = "2.20240822.03.00";

const INNERTUBE_BASE_URL: &str = "https://www.youtube.com/youtubei/v1";

/// The credentials a playback request is made with
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// The session token under test
    pub po_token: PoToken,
    /// The visitor identity the session token was minted for
    pub visitor: VisitorData,
}

/// The platform calls the validator depends on
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Finds currently available videos matching `query`
    async fn search(&self, query: &str) -> Result<Vec<VideoId>, PlatformError>;

    /// Resolves a streamable resource URL for `video_id` using `session`
    async fn streaming_url(
        &self,
        video_id: &VideoIdRef,
        session: &SessionContext,
    ) -> Result<String, PlatformError>;

    /// Checks whether `url` exists, returning the response status
    async fn probe(&self, url: &str) -> Result<u16, PlatformError>;
}

/// A platform client speaking the web client's internal API
#[derive(Clone, Debug)]
pub struct InnertubeClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl InnertubeClient {
    /// Constructs a client against the platform's production endpoints
    pub fn new(client: ClientWithMiddleware) -> Self {
        Self {
            client,
            base_url: INNERTUBE_BASE_URL.to_owned(),
        }
    }

    async fn call(&self, endpoint: &str, body: &Value) -> Result<Value, PlatformError> {
        let response = self
            .client
            .post(format!("{}/{endpoint}?prettyPrint=false", self.base_url))
            .header("x-youtube-client-name", "1")
            .header("x-youtube-client-version", WEB_CLIENT_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::Status(status.as_u16()));
        }

        Ok(response.json().await?)
    }
}

fn client_context(visitor: Option<&VisitorData>) -> Value {
    let mut client = json!({
        "clientName": "WEB",
        "clientVersion": WEB_CLIENT_VERSION,
        "hl": "en",
        "gl": "US",
    });
    if let Some(visitor) = visitor {
        client["visitorData"] = Value::from(visitor.as_str());
    }
    json!({ "client": client })
}

#[async_trait]
impl PlatformClient for InnertubeClient {
    #[tracing::instrument(err, skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<VideoId>, PlatformError> {
        let body = json!({
            "context": client_context(None),
            "query": query,
        });
        let response = self.call("search", &body).await?;
        Ok(collect_video_ids(&response))
    }

    #[tracing::instrument(err, skip(self, session), fields(video.id = %video_id))]
    async fn streaming_url(
        &self,
        video_id: &VideoIdRef,
        session: &SessionContext,
    ) -> Result<String, PlatformError> {
        let body = json!({
            "context": client_context(Some(&session.visitor)),
            "videoId": video_id.as_str(),
            "serviceIntegrityDimensions": { "poToken": session.po_token.as_str() },
            "contentCheckOk": true,
            "racyCheckOk": true,
        });
        let response = self.call("player", &body).await?;
        parse_player_response(&response)
    }

    async fn probe(&self, url: &str) -> Result<u16, PlatformError> {
        let response = self.client.head(url).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Collects the distinct video ids of every video result in a search response
pub(crate) fn collect_video_ids(response: &Value) -> Vec<VideoId> {
    fn walk(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<VideoId>) {
        match value {
            Value::Object(map) => {
                if let Some(id) = map
                    .get("videoRenderer")
                    .and_then(|r| r.get("videoId"))
                    .and_then(Value::as_str)
                {
                    if seen.insert(id.to_owned()) {
                        if let Ok(id) = VideoId::new(id.to_owned()) {
                            out.push(id);
                        }
                    }
                }
                map.values().for_each(|v| walk(v, seen, out));
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, seen, out)),
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk(response, &mut seen, &mut out);
    out
}

/// Extracts the first streamable URL from a player response
pub(crate) fn parse_player_response(response: &Value) -> Result<String, PlatformError> {
    let status = response
        .pointer("/playabilityStatus/status")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    if status != "OK" {
        let reason = response
            .pointer("/playabilityStatus/reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(PlatformError::Unplayable {
            status: status.to_owned(),
            reason: reason.to_owned(),
        });
    }

    ["/streamingData/adaptiveFormats", "/streamingData/formats"]
        .iter()
        .filter_map(|path| response.pointer(path).and_then(Value::as_array))
        .flatten()
        .find_map(|format| format.get("url").and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or(PlatformError::NoStream)
}

/// Appends a query parameter to an absolute URL
pub(crate) fn with_query_param(url: &str, key: &str, value: &str) -> Result<String, PlatformError> {
    let mut url =
        reqwest::Url::parse(url).map_err(|_| PlatformError::MalformedUrl(url.to_owned()))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod search_results {
        use super::*;

        #[test]
        fn collects_nested_ids_once() {
            let response = json!({
                "contents": {
                    "sectionList": [
                        { "videoRenderer": { "videoId": "dQw4w9WgXcQ" } },
                        { "shelf": { "items": [
                            { "videoRenderer": { "videoId": "jNQXAC9IVRw" } },
                            { "videoRenderer": { "videoId": "dQw4w9WgXcQ" } },
                        ] } },
                        { "channelRenderer": { "channelId": "UC123" } },
                    ]
                }
            });

            let ids: Vec<_> = collect_video_ids(&response)
                .into_iter()
                .map(VideoId::take)
                .collect();
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&"dQw4w9WgXcQ".to_owned()));
            assert!(ids.contains(&"jNQXAC9IVRw".to_owned()));
        }

        #[test]
        fn skips_malformed_ids() {
            let response = json!([{ "videoRenderer": { "videoId": "short" } }]);
            assert!(collect_video_ids(&response).is_empty());
        }
    }

    mod player_response {
        use super::*;

        #[test]
        fn prefers_adaptive_formats() {
            let response = json!({
                "playabilityStatus": { "status": "OK" },
                "streamingData": {
                    "formats": [{ "url": "https://example.com/muxed" }],
                    "adaptiveFormats": [{ "signatureCipher": "x" }, { "url": "https://example.com/adaptive" }]
                }
            });
            assert_eq!(
                parse_player_response(&response).unwrap(),
                "https://example.com/adaptive"
            );
        }

        #[test]
        fn unplayable_carries_reason() {
            let response = json!({
                "playabilityStatus": { "status": "LOGIN_REQUIRED", "reason": "Sign in to confirm" }
            });
            match parse_player_response(&response) {
                Err(PlatformError::Unplayable { status, reason }) => {
                    assert_eq!(status, "LOGIN_REQUIRED");
                    assert_eq!(reason, "Sign in to confirm");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }

        #[test]
        fn playable_without_urls_has_no_stream() {
            let response = json!({ "playabilityStatus": { "status": "OK" }, "streamingData": {} });
            assert!(matches!(
                parse_player_response(&response),
                Err(PlatformError::NoStream)
            ));
        }
    }

    mod query_params {
        use super::*;

        #[test]
        fn appends_with_correct_separator() {
            assert_eq!(
                with_query_param("https://h/v", "pot", "abc").unwrap(),
                "https://h/v?pot=abc"
            );
            assert_eq!(
                with_query_param("https://h/v?a=1", "pot", "abc").unwrap(),
                "https://h/v?a=1&pot=abc"
            );
            assert_eq!(
                with_query_param("https://h/v?", "pot", "abc").unwrap(),
                "https://h/v?pot=abc"
            );
        }

        #[test]
        fn encodes_padding_and_keeps_fragment() {
            assert_eq!(
                with_query_param("https://h/v?a=1#t", "pot", "ab==").unwrap(),
                "https://h/v?a=1&pot=ab%3D%3D#t"
            );
        }

        #[test]
        fn reserved_characters_stay_inside_the_value() {
            let url = with_query_param("https://h/v?a=1#t", "pot", "a&b=c d").unwrap();
            let parsed = reqwest::Url::parse(&url).unwrap();

            let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
            assert_eq!(
                pairs,
                [
                    ("a".to_owned(), "1".to_owned()),
                    ("pot".to_owned(), "a&b=c d".to_owned()),
                ]
            );
            assert_eq!(parsed.fragment(), Some("t"));
        }

        #[test]
        fn rejects_relative_urls() {
            assert!(matches!(
                with_query_param("/videoplayback", "pot", "x"),
                Err(PlatformError::MalformedUrl(_))
            ));
        }
    }
}
