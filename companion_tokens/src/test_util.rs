//! Fakes shared by the unit tests

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use companion_reqwest::NetworkConfig;
use tokio::sync::oneshot;

use crate::{
    challenge::{Challenge, ChallengeSource, IntegrityTokenResponse},
    config::SandboxLimits,
    minter::Minter,
    platform::{PlatformClient, SessionContext},
    protocol::GenerationId,
    sandbox::{SandboxEnv, SandboxHandle},
    AttestationRef, GenerationError, IntegrityToken, PlatformError, RequestKey, RequestKeyRef,
    VideoId, VideoIdRef, VisitorData, VisitorDataRef,
};

pub(crate) const FAKE_VM_ENTRY_POINT: &str = "fakeVm";

/// A stand-in challenge VM with the same calling convention as the real one
///
/// The program text steers its behaviour: `throw` throws, `silent` never
/// answers, `no-signal` answers without providing a minter. The minter XORs
/// each identifier byte with the byte-sum of the integrity token and prefixes
/// the key.
pub(crate) const FAKE_VM_SCRIPT: &str = r#"
globalThis.fakeVm = {
  a: function (program, register, flag, unused, noop, lists) {
    if (program === "throw") throw new Error("bad program");
    register(
      function snapshot(done, args) {
        var signal = args[2];
        if (program !== "no-signal") {
          signal.push(function getMinter(integrityToken) {
            var key = 0;
            for (var i = 0; i < integrityToken.length; i++) key = (key + integrityToken[i]) % 256;
            return Promise.resolve(function mint(identifier) {
              var out = new Uint8Array(identifier.length + 1);
              out[0] = key;
              for (var j = 0; j < identifier.length; j++) out[j + 1] = identifier[j] ^ key;
              return Promise.resolve(out);
            });
          });
        }
        if (program === "silent") return;
        setTimeout(function () { done("attested:" + program); }, 0);
      },
      function shutdown() {},
      function passEvent() {},
      function checkCamera() {}
    );
    return [function () {}];
  }
};
"#;

/// The token the fake VM mints for `identifier`
pub(crate) fn expected_token(integrity_token: &[u8], identifier: &str) -> String {
    let key = integrity_token
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    let mut out = vec![key];
    out.extend(identifier.bytes().map(|b| b ^ key));
    URL_SAFE.encode(out)
}

/// A minter over the fake VM with integrity token bytes `[1, 2, 3]`
pub(crate) async fn test_minter(generation: GenerationId) -> Minter {
    let (sandbox, outbox) = SandboxHandle::spawn(
        generation,
        SandboxLimits::default().with_fetch(false),
        NetworkConfig::default(),
    )
    .await
    .unwrap();
    let entry = sandbox
        .load(
            FAKE_VM_SCRIPT.to_owned(),
            FAKE_VM_ENTRY_POINT.to_owned(),
            SandboxEnv {
                visitor: VisitorData::from_static("visitor"),
                request_key: RequestKey::from_static("key"),
            },
        )
        .await
        .unwrap();
    sandbox.solve(entry, "program".to_owned()).await.unwrap();

    Minter::create(sandbox, outbox, &IntegrityToken::from_static("AQID"))
        .await
        .unwrap()
}

/// A challenge source that serves the fake VM
///
/// Each visitor identity is distinct, and so is the integrity token derived
/// from it, so every generation mints differently.
#[derive(Debug, Default)]
pub(crate) struct FakeChallengeSource {
    pub(crate) visitor_fails: AtomicBool,
    pub(crate) visitor_calls: AtomicUsize,
    pub(crate) challenge_calls: AtomicUsize,
    pub(crate) exchange_calls: AtomicUsize,
}

#[async_trait]
impl ChallengeSource for FakeChallengeSource {
    async fn fetch_visitor_identity(&self) -> Result<VisitorData, GenerationError> {
        let n = self.visitor_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.visitor_fails.load(Ordering::SeqCst) {
            return Err(GenerationError::UpstreamUnavailable(
                "visitor endpoint unavailable".into(),
            ));
        }
        Ok(VisitorData::new(format!("visitor-{n}")))
    }

    async fn fetch_challenge(
        &self,
        visitor: &VisitorDataRef,
        _request_key: &RequestKeyRef,
    ) -> Result<Challenge, GenerationError> {
        self.challenge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Challenge {
            interpreter_script: FAKE_VM_SCRIPT.to_owned(),
            program: format!("program-for-{visitor}"),
            global_name: FAKE_VM_ENTRY_POINT.to_owned(),
            message_id: None,
        })
    }

    async fn exchange(
        &self,
        attestation: &AttestationRef,
        _request_key: &RequestKeyRef,
    ) -> Result<IntegrityTokenResponse, GenerationError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Ok(IntegrityTokenResponse {
            integrity_token: IntegrityToken::new(STANDARD.encode(attestation.as_str())),
            estimated_ttl: None,
            mint_refresh_threshold: None,
            websafe_fallback_token: None,
        })
    }
}

/// A platform that serves a fixed search result and accepts chosen videos
#[derive(Debug)]
pub(crate) struct FakePlatform {
    candidates: Vec<VideoId>,
    accepting: HashSet<String>,
    pub(crate) probes: AtomicUsize,
    probed: Mutex<Vec<String>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakePlatform {
    pub(crate) fn new(candidates: Vec<VideoId>) -> Self {
        Self {
            candidates,
            accepting: HashSet::new(),
            probes: AtomicUsize::new(0),
            probed: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// The first search waits until the returned sender fires or is dropped
    pub(crate) fn gated(self) -> (Self, oneshot::Sender<()>) {
        let (open, gate) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(gate);
        (self, open)
    }

    pub(crate) fn accepting(mut self, accepted: Vec<VideoId>) -> Self {
        self.accepting = accepted.into_iter().map(VideoId::take).collect();
        self
    }

    pub(crate) fn last_probe(&self) -> Option<String> {
        self.probed.lock().unwrap().last().cloned()
    }

    pub(crate) fn distinct_probed(&self) -> usize {
        self.probed
            .lock()
            .unwrap()
            .iter()
            .collect::<HashSet<_>>()
            .len()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn search(&self, _query: &str) -> Result<Vec<VideoId>, PlatformError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.candidates.clone())
    }

    async fn streaming_url(
        &self,
        video_id: &VideoIdRef,
        _session: &SessionContext,
    ) -> Result<String, PlatformError> {
        Ok(format!("https://stream.invalid/{video_id}?itag=18"))
    }

    async fn probe(&self, url: &str) -> Result<u16, PlatformError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.probed.lock().unwrap().push(url.to_owned());

        let video_id = url
            .trim_start_matches("https://stream.invalid/")
            .split('?')
            .next()
            .unwrap_or_default();
        if url.contains("pot=") && self.accepting.contains(video_id) {
            Ok(200)
        } else {
            Ok(403)
        }
    }
}
