use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// An opaque visitor identifier issued by the platform's session layer
#[braid(serde)]
pub struct VisitorData;

/// The key identifying this client to the challenge endpoints
#[braid(serde)]
pub struct RequestKey;

/// The solved output of running a challenge program
#[braid(serde, debug = "owned", display = "owned")]
pub struct Attestation;

limited_reveal!(AttestationRef: "ATTESTATION", 12);

/// A credential returned by the platform in exchange for an attestation
#[braid(serde, debug = "owned", display = "owned")]
pub struct IntegrityToken;

limited_reveal!(IntegrityTokenRef: "INTEGRITY TOKEN", 8);

/// A session-wide proof-of-origin token
#[braid(serde, debug = "owned", display = "owned")]
pub struct PoToken;

limited_reveal!(PoTokenRef: "PO TOKEN", 15);

/// A proof-of-origin token bound to a single video
#[braid(serde, debug = "owned", display = "owned")]
pub struct ContentToken;

limited_reveal!(ContentTokenRef: "CONTENT TOKEN", 15);

/// A video identifier
///
/// Video identifiers are exactly 11 characters drawn from `A-Z`, `a-z`,
/// `0-9`, `-` and `_`.
#[braid(serde, validator)]
pub struct VideoId;

/// The number of characters in every video identifier
pub const VIDEO_ID_LEN: usize = 11;

/// A value that is not a well-formed video identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidVideoId {
    /// The identifier does not have exactly 11 characters
    #[error("video ID must be {VIDEO_ID_LEN} characters long, got {0}")]
    Length(usize),
    /// The identifier contains a character outside the allowed set
    #[error("video ID contains invalid character {0:?}")]
    Character(char),
}

impl From<std::convert::Infallible> for InvalidVideoId {
    fn from(x: std::convert::Infallible) -> Self {
        match x {}
    }
}

impl aliri_braid::Validator for VideoId {
    type Error = InvalidVideoId;

    fn validate(raw: &str) -> Result<(), Self::Error> {
        let len = raw.chars().count();
        if len != VIDEO_ID_LEN {
            return Err(InvalidVideoId::Length(len));
        }

        match raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            Some(c) => Err(InvalidVideoId::Character(c)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod video_id {
        use super::*;

        #[test]
        fn accepts_well_formed_ids() {
            for id in ["dQw4w9WgXcQ", "jNQXAC9IVRw", "a-b_c-d_e-f", "___________", "00000000000"] {
                assert!(VideoIdRef::from_str(id).is_ok(), "{id} should be valid");
            }
        }

        #[test]
        fn rejects_wrong_length() {
            assert_eq!(VideoIdRef::from_str("").unwrap_err(), InvalidVideoId::Length(0));
            assert_eq!(
                VideoIdRef::from_str("dQw4w9WgXc").unwrap_err(),
                InvalidVideoId::Length(10)
            );
            assert_eq!(
                VideoIdRef::from_str("dQw4w9WgXcQQ").unwrap_err(),
                InvalidVideoId::Length(12)
            );
        }

        #[test]
        fn rejects_invalid_characters() {
            assert_eq!(
                VideoIdRef::from_str("dQw4w9WgXc!").unwrap_err(),
                InvalidVideoId::Character('!')
            );
            assert_eq!(
                VideoIdRef::from_str("dQw4w9 gXcQ").unwrap_err(),
                InvalidVideoId::Character(' ')
            );
            assert_eq!(
                VideoIdRef::from_str("dQw4w9WgXc/").unwrap_err(),
                InvalidVideoId::Character('/')
            );
        }

        #[test]
        fn rejects_multibyte_characters_by_count() {
            assert_eq!(
                VideoIdRef::from_str("dQw4w9WgXcé").unwrap_err(),
                InvalidVideoId::Character('é')
            );
        }

        #[test]
        fn infallible_sources_convert_into_the_error() {
            fn parse(raw: Result<&str, std::convert::Infallible>) -> Result<VideoId, InvalidVideoId> {
                VideoId::new(raw?.to_owned())
            }

            assert!(parse(Ok("dQw4w9WgXcQ")).is_ok());
            assert_eq!(parse(Ok("short")).unwrap_err(), InvalidVideoId::Length(5));
        }

        #[test]
        fn deserialization_validates() {
            let ok: Result<VideoId, _> = serde_json::from_str("\"dQw4w9WgXcQ\"");
            assert!(ok.is_ok());
            let bad: Result<VideoId, _> = serde_json::from_str("\"../etc/pwd\"");
            assert!(bad.is_err());
        }
    }

    mod secret_formatting {
        use super::*;

        #[test]
        fn hides_token_by_default() {
            let token = PoToken::from_static("MnQTyp0Y2cyGgUHvlJiuQz0bnZ");
            assert_eq!(format!("{}", token), "***PO TOKEN***");
            assert_eq!(format!("{:?}", token), "***PO TOKEN***");

            let borrowed: &PoTokenRef = &token;
            assert_eq!(format!("{}", borrowed), "***PO TOKEN***");
            assert_eq!(format!("{:?}", borrowed), "***PO TOKEN***");
        }

        #[test]
        fn alternate_reveals_bounded_prefix() {
            let token = ContentToken::from_static("abcdefghijklmnopqrstuvwxyz");
            assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
            assert_eq!(format!("{:#6?}", token), "\"abcde…\"");
            assert_eq!(format!("{:#}", token), "abcdefghijklmnopqrstuvwxyz");
        }
    }
}
