//! Background acquisition, validation and renewal of proof-of-origin tokens
//!
//! A video platform gates its streams behind proof-of-origin tokens. Obtaining
//! one means running an obfuscated challenge script the platform hands out,
//! exchanging the result for an integrity token, and then using that to mint a
//! session token plus a content token for each video a client wants to play.
//!
//! This crate performs that work in the background so that request handlers
//! only ever read a ready minter. Each attempt at acquiring a token is a
//! _generation_: it boots its own script sandbox, solves a fresh challenge,
//! creates a minter, and proves the result by streaming a real video with it.
//! Only a generation that has proven itself is promoted, replacing the
//! previous one atomically. A failed generation never disturbs the current
//! minter, and a slow generation that finishes after a newer one has been
//! promoted is simply retired.
//!
//! # General Flow
//!
//! On application start-up, build the network client, the two platform
//! collaborators, and an [`Orchestrator`]. Then hand the orchestrator to a
//! [`RenewalSchedule`], which renews immediately and then on a jittered
//! interval, and give request handlers a [`TokenMinter`].
//!
//! ```
//! use companion_reqwest::{build_client, NetworkConfig};
//! use companion_tokens::{
//!     challenge::BotguardClient, jitter, platform::InnertubeClient, Orchestrator,
//!     RenewalSchedule, VideoId, DEFAULT_RENEWAL_INTERVAL,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = NetworkConfig::default();
//! let client = build_client(&network)?;
//!
//! let orchestrator = Orchestrator::builder(
//!     BotguardClient::new(client.clone()),
//!     InnertubeClient::new(client),
//! )
//! .with_network_config(network)
//! .spawn();
//!
//! let mut minter = orchestrator.minter();
//! let _schedule = RenewalSchedule::spawn(
//!     orchestrator,
//!     DEFAULT_RENEWAL_INTERVAL,
//!     jitter::RandomEarlyJitter::new(std::time::Duration::from_secs(30)),
//! );
//!
//! minter.changed().await?;
//! let token = minter
//!     .mint_content_token(&VideoId::from_static("dQw4w9WgXcQ"))
//!     .await?;
//! tracing::info!(token = format_args!("{:#?}", token), "minted content token");
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example of running the renewal loop against the
//! live platform in the examples folder.

#![cfg_attr(docsrs, feature(doc_cfg))]
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

mod braids;
pub mod challenge;
pub mod config;
mod error;
pub mod jitter;
pub mod metrics;
mod minter;
mod orchestrator;
pub mod platform;
mod protocol;
mod renewal;
pub mod sandbox;
mod validator;
mod worker;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use config::{GenerationConfig, SandboxLimits, StageTimeouts, DEFAULT_REQUEST_KEY};
pub use error::{
    AttestationError, ContentTokenError, GenerationError, MintError, NotReady,
    OrchestratorStopped, PlatformError, SandboxLoadError, ValidationError,
    TOKEN_MINTER_NOT_READY_MESSAGE,
};
pub use minter::Minter;
pub use orchestrator::{
    GenerationStatus, MinterHandle, Orchestrator, OrchestratorBuilder, Renewal, TokenMinter,
};
pub use protocol::{GenerationId, GenerationState};
pub use renewal::{RenewalSchedule, DEFAULT_RENEWAL_INTERVAL};
