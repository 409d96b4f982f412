//! Isolated execution of platform-supplied challenge scripts
//!
//! Each generation owns exactly one sandbox. A sandbox is an embedded script
//! engine confined to a dedicated OS thread: the engine's context is neither
//! `Send` nor `Sync`, so the rest of the crate talks to it only through a
//! [`SandboxHandle`], which forwards typed commands over a channel.
//!
//! Scripts see a synthetic browser environment (`window`, `document`,
//! `navigator`, `location`, timers and a `fetch` backed by the host's network
//! client) and never the host's own globals. Evaluation is bounded by the loop
//! iteration and recursion limits in [`SandboxLimits`].

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use boa_engine::{
    js_string, native_function::NativeFunction, Context, JsArgs, JsNativeError, JsResult,
    JsString, JsValue, Source,
};
use companion_reqwest::NetworkConfig;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::SandboxLimits,
    protocol::{ContentTokenRequest, ContentTokenResponse, GenerationId},
    Attestation, AttestationError, ContentToken, MintError, PoToken, RequestKey,
    SandboxLoadError, VisitorData, VisitorDataRef,
};

const ENVIRONMENT: &str = include_str!("sandbox/environment.js");

thread_local! {
    static HOST_FETCH: RefCell<Option<HostFetch>> = const { RefCell::new(None) };
}

/// Identity values made visible to scripts as `companionIdentity`
#[derive(Clone, Debug)]
pub struct SandboxEnv {
    /// The generation's visitor identity
    pub visitor: VisitorData,
    /// The key identifying this client to the challenge endpoints
    pub request_key: RequestKey,
}

/// The entry points a loaded challenge script exposes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoints {
    global_name: String,
}

impl EntryPoints {
    /// The global under which the challenge VM registered itself
    #[inline]
    pub fn global_name(&self) -> &str {
        &self.global_name
    }
}

/// A resource-bounded script engine with an injected browser environment
pub struct ScriptSandbox {
    context: Context,
}

impl fmt::Debug for ScriptSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSandbox").finish_non_exhaustive()
    }
}

impl ScriptSandbox {
    /// Creates a fresh engine and installs the synthetic environment
    ///
    /// The `fetch` capability is only wired to the network when the sandbox is
    /// driven from a [`SandboxHandle`]; a bare sandbox rejects every fetch.
    pub fn new(limits: &SandboxLimits) -> Result<Self, SandboxLoadError> {
        let mut context = Context::builder()
            .build()
            .map_err(|err| SandboxLoadError::Threw(err.to_string()))?;

        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit());
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit());

        if limits.allow_fetch() {
            context
                .register_global_builtin_callable(
                    js_string!("__hostFetch"),
                    2,
                    NativeFunction::from_fn_ptr(host_fetch),
                )
                .map_err(|err| SandboxLoadError::Threw(err.to_string()))?;
        }

        let mut sandbox = Self { context };
        let settings = serde_json::json!({
            "userAgent": limits.user_agent(),
            "allowFetch": limits.allow_fetch(),
        });
        sandbox
            .eval(&format!("(function (__limits) {{\n{ENVIRONMENT}\n}})({settings});"))
            .map_err(SandboxLoadError::Threw)?;

        Ok(sandbox)
    }

    /// Evaluates untrusted script source and locates its entry point
    ///
    /// The source is evaluated as the body of a fresh function so that its
    /// top-level declarations do not leak into the environment. The script
    /// must register an object with a callable `a` member under
    /// `entry_point`.
    pub fn execute_untrusted_script(
        &mut self,
        source: &str,
        entry_point: &str,
        env: &SandboxEnv,
    ) -> Result<EntryPoints, SandboxLoadError> {
        let identity = serde_json::json!({
            "visitorData": env.visitor.as_str(),
            "requestKey": env.request_key.as_str(),
        });
        self.eval(&format!(
            "__companion.beginTurn(); __companion.setIdentity({});",
            js_literal(&identity.to_string())
        ))
        .map_err(SandboxLoadError::Threw)?;

        self.eval(&format!("(function () {{\n{source}\n}}).call(globalThis);"))
            .map_err(SandboxLoadError::Threw)?;

        let present = self
            .eval(&format!(
                "__companion.hasEntryPoint({});",
                js_literal(entry_point)
            ))
            .map_err(SandboxLoadError::Threw)?;

        if present.as_boolean() == Some(true) {
            Ok(EntryPoints {
                global_name: entry_point.to_owned(),
            })
        } else {
            Err(SandboxLoadError::MissingEntryPoint(entry_point.to_owned()))
        }
    }

    /// Runs the challenge program and collects its attestation
    pub fn solve(
        &mut self,
        entry_points: &EntryPoints,
        program: &str,
    ) -> Result<Attestation, AttestationError> {
        self.eval(&format!(
            "__companion.beginTurn(); __companion.snapshot({}, {});",
            js_literal(entry_points.global_name()),
            js_literal(program)
        ))
        .map_err(AttestationError::Threw)?;

        let response = self
            .eval_string("__companion.attestation();")
            .map_err(AttestationError::Threw)?
            .ok_or(AttestationError::NoResponse)?;

        let signals = self
            .eval("__companion.signalLength();")
            .map_err(AttestationError::Threw)?;
        if signals.as_number().unwrap_or(0.0) < 1.0 {
            return Err(AttestationError::NoSignal);
        }

        Ok(Attestation::new(response))
    }

    /// Builds the minter from the integrity token and the signal output
    pub fn create_minter(&mut self, integrity_token: &[u8]) -> Result<(), MintError> {
        self.eval(&format!(
            "__companion.beginTurn(); __companion.createMinter({});",
            js_literal(&byte_array(integrity_token))
        ))
        .map_err(MintError::NoMinter)?;

        let ready = self
            .eval("__companion.minterReady();")
            .map_err(MintError::NoMinter)?;

        if ready.as_boolean() == Some(true) {
            Ok(())
        } else {
            Err(MintError::NoMinter(
                "minter factory did not resolve".to_owned(),
            ))
        }
    }

    /// Mints a token bound to `identifier`, encoded as websafe base64
    pub fn mint(&mut self, identifier: &str) -> Result<String, MintError> {
        self.eval(&format!(
            "__companion.beginTurn(); __companion.mint({});",
            js_literal(&byte_array(identifier.as_bytes()))
        ))
        .map_err(MintError::Failed)?;

        let minted = self
            .eval_string("__companion.minted();")
            .map_err(MintError::Failed)?
            .ok_or_else(|| MintError::Failed("minter did not resolve".to_owned()))?;

        let bytes: Vec<u8> = serde_json::from_str(&minted)
            .map_err(|err| MintError::Failed(format!("minter output is not bytes: {err}")))?;

        Ok(URL_SAFE.encode(bytes))
    }

    fn eval(&mut self, source: &str) -> Result<JsValue, String> {
        let result = self.context.eval(Source::from_bytes(source));
        let _ = self.context.run_jobs();
        result.map_err(|err| err.to_string())
    }

    fn eval_string(&mut self, source: &str) -> Result<Option<String>, String> {
        let value = self.eval(source)?;
        if value.is_null_or_undefined() {
            return Ok(None);
        }

        value
            .to_string(&mut self.context)
            .map(|s| Some(s.to_std_string_escaped()))
            .map_err(|err| err.to_string())
    }
}

fn js_literal(value: &str) -> String {
    // A JSON string is a valid script string literal.
    serde_json::Value::from(value).to_string()
}

fn byte_array(bytes: &[u8]) -> String {
    serde_json::Value::from(bytes.to_vec()).to_string()
}

#[derive(Debug, Default, Deserialize)]
struct FetchInit {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

struct HostFetch {
    runtime: tokio::runtime::Runtime,
    client: ClientWithMiddleware,
}

impl HostFetch {
    fn new(network: &NetworkConfig) -> Result<Self, SandboxLoadError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SandboxLoadError::Spawn)?;
        let client = companion_reqwest::build_client(network)
            .map_err(|err| SandboxLoadError::Spawn(std::io::Error::other(err)))?;

        Ok(Self { runtime, client })
    }

    fn perform(&self, url: &str, init: FetchInit) -> Result<String, String> {
        let method = init
            .method
            .as_deref()
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|err| err.to_string())?;

        let mut request = self.client.request(method, url);
        for (name, value) in &init.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = init.body {
            request = request.body(body);
        }

        self.runtime.block_on(async move {
            let response = request.send().await.map_err(|err| err.to_string())?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|err| err.to_string())?;
            tracing::trace!(http.status_code = status, "sandbox fetch completed");
            Ok(serde_json::json!({ "status": status, "body": body }).to_string())
        })
    }
}

fn host_fetch(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = args
        .get_or_undefined(0)
        .to_string(context)?
        .to_std_string_escaped();
    let init = args
        .get_or_undefined(1)
        .to_string(context)?
        .to_std_string_escaped();
    let init: FetchInit = serde_json::from_str(&init).unwrap_or_default();

    let response = HOST_FETCH
        .with(|cell| match cell.borrow().as_ref() {
            Some(fetch) => fetch.perform(&url, init),
            None => Err("network access is not available in this sandbox".to_owned()),
        })
        .map_err(|msg| JsNativeError::typ().with_message(msg))?;

    Ok(JsValue::from(JsString::from(response.as_str())))
}

enum SandboxCommand {
    Load {
        source: String,
        entry_point: String,
        env: SandboxEnv,
        reply: oneshot::Sender<Result<EntryPoints, SandboxLoadError>>,
    },
    Solve {
        entry_points: EntryPoints,
        program: String,
        reply: oneshot::Sender<Result<Attestation, AttestationError>>,
    },
    CreateMinter {
        integrity_token: Vec<u8>,
        reply: oneshot::Sender<Result<(), MintError>>,
    },
    MintSession {
        visitor: VisitorData,
        reply: oneshot::Sender<Result<PoToken, MintError>>,
    },
    ContentToken(ContentTokenRequest),
    Shutdown,
}

/// A handle to a sandbox running on its own thread
///
/// Commands are processed strictly in the order they are sent. Dropping every
/// handle, or calling [`shutdown`](Self::shutdown), stops the thread once the
/// commands already queued have been processed.
#[derive(Clone, Debug)]
pub(crate) struct SandboxHandle {
    generation: GenerationId,
    commands: mpsc::UnboundedSender<SandboxCommand>,
}

impl fmt::Debug for SandboxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load { .. } => "Load",
            Self::Solve { .. } => "Solve",
            Self::CreateMinter { .. } => "CreateMinter",
            Self::MintSession { .. } => "MintSession",
            Self::ContentToken(_) => "ContentToken",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SandboxHandle {
    /// Starts a sandbox thread for `generation` and waits for it to boot
    ///
    /// Content-token responses are delivered on the returned receiver.
    pub(crate) async fn spawn(
        generation: GenerationId,
        limits: SandboxLimits,
        network: NetworkConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ContentTokenResponse>), SandboxLoadError> {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (responses, outbox) = mpsc::unbounded_channel();
        let (booted, boot) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("potoken-sandbox-{generation}"))
            .spawn(move || run(generation, &limits, &network, inbox, responses, booted))
            .map_err(SandboxLoadError::Spawn)?;

        boot.await.map_err(|_| SandboxLoadError::Gone)??;

        tracing::debug!(generation.id = %generation, "sandbox booted");
        Ok((
            Self {
                generation,
                commands,
            },
            outbox,
        ))
    }

    /// The generation that owns this sandbox
    #[inline]
    pub(crate) fn generation(&self) -> GenerationId {
        self.generation
    }

    pub(crate) async fn load(
        &self,
        source: String,
        entry_point: String,
        env: SandboxEnv,
    ) -> Result<EntryPoints, SandboxLoadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SandboxCommand::Load {
                source,
                entry_point,
                env,
                reply,
            })
            .map_err(|_| SandboxLoadError::Gone)?;
        rx.await.map_err(|_| SandboxLoadError::Gone)?
    }

    pub(crate) async fn solve(
        &self,
        entry_points: EntryPoints,
        program: String,
    ) -> Result<Attestation, AttestationError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SandboxCommand::Solve {
                entry_points,
                program,
                reply,
            })
            .map_err(|_| AttestationError::Gone)?;
        rx.await.map_err(|_| AttestationError::Gone)?
    }

    pub(crate) async fn create_minter(&self, integrity_token: Vec<u8>) -> Result<(), MintError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SandboxCommand::CreateMinter {
                integrity_token,
                reply,
            })
            .map_err(|_| MintError::Retired)?;
        rx.await.map_err(|_| MintError::Retired)?
    }

    pub(crate) async fn mint_session(&self, visitor: &VisitorDataRef) -> Result<PoToken, MintError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SandboxCommand::MintSession {
                visitor: visitor.to_owned(),
                reply,
            })
            .map_err(|_| MintError::Retired)?;
        rx.await.map_err(|_| MintError::Retired)?
    }

    /// Queues a content-token request; the response arrives on the outbox
    pub(crate) fn request_content_token(
        &self,
        request: ContentTokenRequest,
    ) -> Result<(), MintError> {
        self.commands
            .send(SandboxCommand::ContentToken(request))
            .map_err(|_| MintError::Retired)
    }

    /// Stops the sandbox after the commands already queued
    pub(crate) fn shutdown(&self) {
        if self.commands.send(SandboxCommand::Shutdown).is_ok() {
            tracing::debug!(generation.id = %self.generation, "sandbox shutdown requested");
        }
    }
}

fn run(
    generation: GenerationId,
    limits: &SandboxLimits,
    network: &NetworkConfig,
    mut inbox: mpsc::UnboundedReceiver<SandboxCommand>,
    responses: mpsc::UnboundedSender<ContentTokenResponse>,
    booted: oneshot::Sender<Result<(), SandboxLoadError>>,
) {
    if limits.allow_fetch() {
        match HostFetch::new(network) {
            Ok(fetch) => HOST_FETCH.with(|cell| *cell.borrow_mut() = Some(fetch)),
            Err(err) => {
                let _ = booted.send(Err(err));
                return;
            }
        }
    }

    let mut sandbox = match ScriptSandbox::new(limits) {
        Ok(sandbox) => sandbox,
        Err(err) => {
            let _ = booted.send(Err(err));
            return;
        }
    };

    if booted.send(Ok(())).is_err() {
        return;
    }

    let mut poisoned = None;
    while let Some(command) = inbox.blocking_recv() {
        match command {
            SandboxCommand::Load {
                source,
                entry_point,
                env,
                reply,
            } => {
                let result = guarded(
                    &mut poisoned,
                    || sandbox.execute_untrusted_script(&source, &entry_point, &env),
                    SandboxLoadError::Threw,
                );
                let _ = reply.send(result);
            }
            SandboxCommand::Solve {
                entry_points,
                program,
                reply,
            } => {
                let result = guarded(
                    &mut poisoned,
                    || sandbox.solve(&entry_points, &program),
                    AttestationError::Threw,
                );
                let _ = reply.send(result);
            }
            SandboxCommand::CreateMinter {
                integrity_token,
                reply,
            } => {
                let result = guarded(
                    &mut poisoned,
                    || sandbox.create_minter(&integrity_token),
                    MintError::NoMinter,
                );
                let _ = reply.send(result);
            }
            SandboxCommand::MintSession { visitor, reply } => {
                let result = guarded(
                    &mut poisoned,
                    || sandbox.mint(visitor.as_str()),
                    MintError::Failed,
                );
                let _ = reply.send(result.map(PoToken::new));
            }
            SandboxCommand::ContentToken(request) => {
                let result = guarded(
                    &mut poisoned,
                    || sandbox.mint(request.video_id.as_str()),
                    MintError::Failed,
                )
                .map(ContentToken::new);
                tracing::trace!(
                    generation.id = %generation,
                    request.id = %request.request_id,
                    video.id = %request.video_id,
                    "content token minted"
                );
                let response = ContentTokenResponse {
                    request_id: request.request_id,
                    result,
                };
                if responses.send(response).is_err() {
                    tracing::debug!(generation.id = %generation, "no one is listening for content tokens");
                }
            }
            SandboxCommand::Shutdown => break,
        }
    }

    HOST_FETCH.with(|cell| cell.borrow_mut().take());
    tracing::debug!(generation.id = %generation, "sandbox stopped");
}

/// Runs one engine step, turning an engine panic into a script error
///
/// The engine is not trusted to be consistent after a panic, so every later
/// step fails with the original cause instead of running.
fn guarded<T, E>(
    poisoned: &mut Option<String>,
    step: impl FnOnce() -> Result<T, E>,
    threw: impl FnOnce(String) -> E,
) -> Result<T, E> {
    if let Some(cause) = poisoned {
        return Err(threw(format!(
            "sandbox is unusable after an engine panic: {cause}"
        )));
    }

    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => {
            let cause = panic_message(payload.as_ref());
            tracing::error!(cause = %cause, "script engine panicked");
            let message = format!("script engine panicked: {cause}");
            *poisoned = Some(cause);
            Err(threw(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
