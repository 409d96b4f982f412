//! Wire shapes of the challenge endpoints
//!
//! Both endpoints speak positional JSON arrays rather than objects, so
//! responses are read as [`serde_json::Value`] and picked apart by index.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{AttestationRef, IntegrityToken, RequestKeyRef};

/// A response from a challenge endpoint that could not be understood
#[derive(Debug, Error)]
pub enum MalformedResponse {
    /// The scrambled challenge was not valid base64
    #[error("scrambled challenge is not valid base64")]
    Base64(#[from] base64::DecodeError),
    /// A body was not the expected JSON
    #[error("response is not valid JSON")]
    Json(#[from] serde_json::Error),
    /// A required field was absent or had the wrong type
    #[error("response is missing {0}")]
    Missing(&'static str),
}

/// Body of a `Create` request
#[derive(Debug, Serialize)]
pub(crate) struct CreateRequest<'a>(pub(crate) [&'a RequestKeyRef; 1]);

/// Body of a `GenerateIT` request
#[derive(Debug, Serialize)]
pub(crate) struct GenerateItRequest<'a>(pub(crate) &'a RequestKeyRef, pub(crate) &'a AttestationRef);

/// Where the interpreter for a challenge comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterpreterSource {
    /// The script was delivered inline
    Inline(String),
    /// The script must be fetched from this URL
    Url(String),
}

/// A decoded challenge, before its interpreter has been resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeData {
    /// Identifies the challenge message
    pub message_id: Option<String>,
    /// The interpreter script or where to obtain it
    pub interpreter: InterpreterSource,
    /// A digest identifying the interpreter version
    pub interpreter_hash: Option<String>,
    /// The opaque program the interpreter runs
    pub program: String,
    /// The global under which the interpreter registers itself
    pub global_name: String,
    /// Opaque client experiment state
    pub client_experiments_state_blob: Option<String>,
}

/// Reverses the scrambling applied to inline challenge data
///
/// The data is base64; every decoded byte is offset by 97 (mod 256) before
/// being read as UTF-8 JSON.
pub(crate) fn descramble(scrambled: &str) -> Result<Value, MalformedResponse> {
    let bytes: Vec<u8> = STANDARD
        .decode(scrambled)?
        .into_iter()
        .map(|b| b.wrapping_add(97))
        .collect();
    Ok(serde_json::from_slice(&bytes)?)
}

fn first_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            .map(str::to_owned),
        _ => None,
    }
}

fn string_at(data: &[Value], idx: usize) -> Option<String> {
    data.get(idx).and_then(Value::as_str).map(str::to_owned)
}

/// Decodes the body of a `Create` response
pub(crate) fn parse_create_response(raw: &Value) -> Result<ChallengeData, MalformedResponse> {
    let descrambled;
    let data = match raw.get(1).and_then(Value::as_str) {
        Some(scrambled) => {
            descrambled = descramble(scrambled)?;
            descrambled.as_array()
        }
        None => raw.get(0).and_then(Value::as_array),
    }
    .ok_or(MalformedResponse::Missing("challenge data"))?;

    let interpreter = match (first_string(data.get(1)), first_string(data.get(2))) {
        (Some(script), _) => InterpreterSource::Inline(script),
        (None, Some(url)) => InterpreterSource::Url(url),
        (None, None) => return Err(MalformedResponse::Missing("interpreter")),
    };

    Ok(ChallengeData {
        message_id: string_at(data, 0),
        interpreter,
        interpreter_hash: string_at(data, 3),
        program: string_at(data, 4).ok_or(MalformedResponse::Missing("program"))?,
        global_name: string_at(data, 5).ok_or(MalformedResponse::Missing("global name"))?,
        client_experiments_state_blob: string_at(data, 7),
    })
}

/// The integrity token and its metadata
#[derive(Clone, Debug)]
pub struct IntegrityTokenResponse {
    /// The integrity token
    pub integrity_token: IntegrityToken,
    /// How long the platform expects the token to remain valid
    pub estimated_ttl: Option<Duration>,
    /// How long before expiry a new minter should be created
    pub mint_refresh_threshold: Option<Duration>,
    /// A fallback token usable when minting is unavailable
    pub websafe_fallback_token: Option<String>,
}

fn seconds_at(data: &[Value], idx: usize) -> Option<Duration> {
    data.get(idx).and_then(Value::as_u64).map(Duration::from_secs)
}

/// Decodes the body of a `GenerateIT` response
///
/// Returns `None` if the body does not carry an integrity token, which the
/// platform uses to signal a rejected attestation.
pub(crate) fn parse_generate_it_response(raw: &Value) -> Option<IntegrityTokenResponse> {
    let data = raw.as_array()?;
    let integrity_token = data.first()?.as_str()?;

    Some(IntegrityTokenResponse {
        integrity_token: IntegrityToken::new(integrity_token.to_owned()),
        estimated_ttl: seconds_at(data, 1),
        mint_refresh_threshold: seconds_at(data, 2),
        websafe_fallback_token: string_at(data, 3),
    })
}

/// Converts an integrity token to the bytes handed to the minter factory
///
/// Integrity tokens use a websafe alphabet with `.` as padding and the
/// padding is not always present.
pub(crate) fn integrity_token_bytes(token: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );

    let standard: String = token
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            '.' => '=',
            c => c,
        })
        .collect();
    LENIENT.decode(standard)
}
