//! Single-use containers.
//!
//! A [`Container`] is created from an [`Image`], runs exactly one command and
//! is removed from the engine afterwards, whatever happened in between. Two
//! ways of running are offered:
//!
//! - [`Container::run`] runs a command to completion (optionally feeding it
//!   stdin), then collects its logs, commits its filesystem into a new image
//!   and reads its exit code;
//! - [`Container::run_streamed`] starts a long-running command with published
//!   ports and streams its output to a sink until it exits or is stopped.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

use crate::engine::{
    argv, check_combined_output, check_output, check_status, command_line, BoxedWriter, Engine,
    EngineError, EngineOutput, EngineProcess, ProcessIo,
};
use crate::image::{Image, ImageError};
use crate::revspec::{is_revision, RevisionSpec};

/// Errors produced while running a container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container already ran; containers are single-use")]
    AlreadyRun,

    #[error("engine didn't report a container id")]
    MissingId,

    /// Raised by a run body.
    #[error("{0}")]
    BodyFailed(String),
}

impl ContainerError {
    pub fn body(message: impl Into<String>) -> Self {
        ContainerError::BodyFailed(message.into())
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Options for starting a container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Attach a writable stdin, handed to the body through [`RunHandle`].
    pub stdin: bool,
    /// Container ports published on random host ports.
    pub ports: Vec<u16>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn publish(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    fn run_args(&self, mode: &[&str], revision: &str, command: &[String]) -> Vec<String> {
        let mut args = argv(&["run"]);
        args.extend(argv(mode));
        if let Some(user) = &self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(revision.to_string());
        args.extend(command.iter().cloned());
        args
    }
}

/// What a [`Container::run`] body gets to work with.
pub struct RunHandle {
    id: String,
    stdin: Option<BoxedWriter>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The container's stdin, if it was requested. Dropping it signals EOF.
    pub fn stdin(&mut self) -> Option<&mut BoxedWriter> {
        self.stdin.as_mut()
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// What a [`Container::run_streamed`] body gets to work with.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub id: String,
    /// Container port to host port.
    pub ports: BTreeMap<u16, u16>,
}

/// Grace period used when a run has to stop its own container.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

type ActiveId = Arc<Mutex<Option<String>>>;

fn lock(active: &ActiveId) -> MutexGuard<'_, Option<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stops a container from another task while it runs.
#[derive(Clone)]
pub struct ContainerStopper {
    engine: Arc<dyn Engine>,
    active: ActiveId,
    stop_requested: Arc<AtomicBool>,
}

impl ContainerStopper {
    pub fn container_id(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    /// Ask the engine to stop the container, waiting at most `grace` before
    /// it is killed. Returns `false` when no container is running.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let id = {
            let active = lock(&self.active);
            let Some(id) = active.clone() else {
                return Ok(false);
            };
            // Set under the lock so removal can't slip in between.
            self.stop_requested.store(true, Ordering::SeqCst);
            id
        };
        let seconds = grace.as_secs().to_string();
        check_output(
            self.engine.as_ref(),
            &argv(&["stop", "-t", seconds.as_str(), id.as_str()]),
        )
        .await?;
        debug!(container = short_id(&id), "container stopped");
        Ok(true)
    }
}

impl fmt::Debug for ContainerStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerStopper")
            .field("container", &self.container_id())
            .finish()
    }
}

/// A single-use container created from an image.
pub struct Container {
    image: Image,
    commit_as: Option<RevisionSpec>,
    active: ActiveId,
    stop_requested: Arc<AtomicBool>,
    started: bool,
    logs: Option<Vec<u8>>,
    exit_code: Option<i32>,
    result: Option<Image>,
    ports: BTreeMap<u16, u16>,
    stop_grace: Duration,
}

impl Container {
    pub(crate) fn new(image: Image, commit_as: Option<RevisionSpec>) -> Self {
        Self {
            image,
            commit_as,
            active: Arc::new(Mutex::new(None)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            started: false,
            logs: None,
            exit_code: None,
            result: None,
            ports: BTreeMap::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Grace period used when the container is stopped after a failed body.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Engine id of the running container.
    pub fn id(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    /// Output captured by [`Container::run`].
    pub fn logs(&self) -> Option<&[u8]> {
        self.logs.as_deref()
    }

    pub fn logs_text(&self) -> String {
        self.logs
            .as_deref()
            .map(|logs| String::from_utf8_lossy(logs).into_owned())
            .unwrap_or_default()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Whether a stop was sent to the container while it was still there.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Image committed at the end of [`Container::run`].
    pub fn result(&self) -> Option<&Image> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<Image> {
        self.result.take()
    }

    /// Published ports of a streamed run, container port to host port.
    pub fn ports(&self) -> &BTreeMap<u16, u16> {
        &self.ports
    }

    pub fn stopper(&self) -> ContainerStopper {
        ContainerStopper {
            engine: self.image.engine().clone(),
            active: self.active.clone(),
            stop_requested: self.stop_requested.clone(),
        }
    }

    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        self.stopper().stop(grace).await
    }

    fn engine(&self) -> Arc<dyn Engine> {
        self.image.engine().clone()
    }

    fn claim(&mut self) -> Result<String> {
        if self.started {
            return Err(ContainerError::AlreadyRun);
        }
        self.started = true;
        Ok(self.image.revision()?.to_string())
    }

    /// Run `command` to completion.
    ///
    /// `body` runs once the container has started; with
    /// [`RunOptions::with_stdin`] it can write to the container's stdin.
    /// Afterwards the container is waited for and, if the body succeeded,
    /// its logs, committed image and exit code are collected concurrently.
    /// The container is then removed exactly once, including when the body
    /// fails or panics. A removal failure is reported only when nothing else
    /// failed before it.
    #[instrument(skip_all, fields(image = %self.image))]
    pub async fn run<F, Fut, T>(&mut self, command: &[String], options: RunOptions, body: F) -> Result<T>
    where
        F: FnOnce(RunHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let revision = self.claim()?;
        let mut process = match self.start(command, &options, &revision).await {
            Ok(process) => process,
            Err(e) => return self.abort(e).await,
        };

        let handle = RunHandle {
            id: self.id().unwrap_or_default(),
            stdin: process.take_stdin(),
        };
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;
        if !matches!(outcome, Ok(Ok(_))) {
            self.stop_quietly().await;
        }
        let waited = process.wait().await;

        match outcome {
            Err(panic) => self.remove_and_resume(panic).await,
            Ok(Err(e)) => self.finish(Err(e)).await,
            Ok(Ok(value)) => {
                let collected = match waited {
                    Ok(_) => self.collect().await,
                    Err(e) => Err(e.into()),
                };
                self.finish(collected.map(|()| value)).await
            }
        }
    }

    /// Start `command` detached with its ports published and stream its
    /// output into `output` until it exits.
    ///
    /// `body` gets the container id and the port map once the container is
    /// up; the container can be stopped meanwhile through
    /// [`Container::stopper`]. Nothing is committed. Output printed before
    /// the engine attached to the container is lost.
    #[instrument(skip_all, fields(image = %self.image))]
    pub async fn run_streamed<F, Fut, T, W>(
        &mut self,
        command: &[String],
        options: RunOptions,
        output: W,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(StreamHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let revision = self.claim()?;
        let engine = self.engine();
        let args = options.run_args(&["-d"], &revision, command);
        let id = match self.start_detached(&args).await {
            Ok(id) => id,
            Err(e) => return self.finish(Err(e)).await,
        };

        let mut attach = match engine
            .spawn(&argv(&["attach", id.as_str()]), ProcessIo::output())
            .await
        {
            Ok(process) => process,
            Err(e) => return self.abort(e.into()).await,
        };
        let pump = attach.take_output().map(|mut reader| {
            let mut output = output;
            tokio::spawn(async move {
                tokio::io::copy(&mut reader, &mut output).await?;
                output.flush().await
            })
        });

        let ports = match inspect(engine.as_ref(), &id).await {
            Ok(info) => info.port_table(),
            Err(e) => return self.abort(e).await,
        };
        self.ports = ports.clone();

        let handle = StreamHandle { id, ports };
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;
        if !matches!(outcome, Ok(Ok(_))) {
            self.stop_quietly().await;
        }
        let waited = attach.wait().await;
        if let Some(pump) = pump {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "couldn't stream container output"),
                Err(e) => warn!(error = %e, "container output task failed"),
            }
        }

        match outcome {
            Err(panic) => self.remove_and_resume(panic).await,
            Ok(Err(e)) => self.finish(Err(e)).await,
            Ok(Ok(value)) => {
                let exited = match waited {
                    Ok(_) => self.read_exit_code().await,
                    Err(e) => Err(e.into()),
                };
                self.finish(exited.map(|()| value)).await
            }
        }
    }

    /// Install distribution packages, committing the result like any run.
    /// Does nothing, and leaves the container unused, when `packages` is empty.
    pub async fn install_system_packages(&mut self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let script = format!(
            "export DEBIAN_FRONTEND=noninteractive; apt-get update; apt-get -y install {}; \
             apt-get clean; rm -rf /var/lib/apt/lists/*",
            packages.join(" ")
        );
        let command = argv(&["/bin/sh", "-c", script.as_str()]);
        self.run(&command, RunOptions::new(), |_| async { Ok(()) })
            .await
    }

    async fn start(
        &mut self,
        command: &[String],
        options: &RunOptions,
        revision: &str,
    ) -> Result<Box<dyn EngineProcess>> {
        let engine = self.engine();
        if !options.stdin {
            let args = options.run_args(&["-t", "-d"], revision, command);
            let id = self.start_detached(&args).await?;
            let waiter = engine
                .spawn(&argv(&["wait", id.as_str()]), ProcessIo::none())
                .await?;
            return Ok(waiter);
        }

        let args = options.run_args(&["-i", "-a", "stdin"], revision, command);
        let mut process = engine.spawn(&args, ProcessIo::stdin_and_output()).await?;
        let output = process.take_output().ok_or(ContainerError::MissingId)?;
        let mut reader = BufReader::new(output);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let id = match parse_container_id(engine.program(), &args, &line) {
            Ok(id) => id,
            Err(malformed) => {
                // No id: the engine most likely refused to start the container.
                drop(process.take_stdin());
                let mut stdout = line.into_bytes();
                reader.read_to_end(&mut stdout).await?;
                let status = process.wait().await?;
                let output = EngineOutput {
                    status,
                    stdout,
                    stderr: Vec::new(),
                };
                check_status(engine.program(), &args, output)?;
                return Err(malformed);
            }
        };
        debug!(container = short_id(&id), "container started");
        *lock(&self.active) = Some(id);
        Ok(process)
    }

    async fn start_detached(&mut self, args: &[String]) -> Result<String> {
        let engine = self.engine();
        let out = check_output(engine.as_ref(), args).await?;
        let id = parse_container_id(engine.program(), args, &String::from_utf8_lossy(&out))?;
        debug!(container = short_id(&id), "container started");
        *lock(&self.active) = Some(id.clone());
        Ok(id)
    }

    async fn collect(&mut self) -> Result<()> {
        let id = self.id().ok_or(ContainerError::MissingId)?;
        let engine = self.engine();
        let logs_args = argv(&["logs", id.as_str()]);

        let (logs, committed, info) = tokio::join!(
            check_combined_output(engine.as_ref(), &logs_args),
            self.commit(&engine, &id),
            inspect(engine.as_ref(), &id),
        );

        let committed = committed?;
        let logs = logs?;
        let info = info?;
        debug!(
            container = short_id(&id),
            logs = %bytes_to_human(logs.len() as u64),
            exit_code = info.state.exit_code,
            result = %committed,
            "container finished"
        );
        self.result = Some(committed);
        self.logs = Some(logs);
        self.exit_code = Some(info.state.exit_code);
        Ok(())
    }

    async fn commit(&self, engine: &Arc<dyn Engine>, id: &str) -> Result<Image> {
        let source = self.image.spec()?;
        let target = self.commit_as.as_ref().unwrap_or(source);

        let mut args = argv(&["commit", id]);
        if let Some(name) = target.fully_qualified_name() {
            match target.tag() {
                Some(tag) => args.push(format!("{name}:{tag}")),
                None => args.push(name),
            }
        }
        let out = check_output(engine.as_ref(), &args).await?;
        let revision = parse_revision(engine.program(), &args, &String::from_utf8_lossy(&out))?;

        let tag = target
            .repository()
            .and_then(|_| target.tag())
            .map(str::to_string);
        let spec = RevisionSpec::new(
            target.owner().map(str::to_string),
            target.repository().map(str::to_string),
            Some(revision),
            tag,
        );
        Ok(Image::from_resolved(engine.clone(), spec))
    }

    async fn read_exit_code(&mut self) -> Result<()> {
        let id = self.id().ok_or(ContainerError::MissingId)?;
        let info = inspect(self.engine().as_ref(), &id).await?;
        debug!(container = short_id(&id), exit_code = info.state.exit_code, "container exited");
        self.exit_code = Some(info.state.exit_code);
        Ok(())
    }

    async fn stop_quietly(&self) {
        if let Err(e) = self.stop(self.stop_grace).await {
            warn!(error = %e, "couldn't stop container");
        }
    }

    async fn remove(&mut self) -> Result<()> {
        let id = lock(&self.active).take();
        let Some(id) = id else {
            return Ok(());
        };
        check_output(self.engine().as_ref(), &argv(&["rm", id.as_str()])).await?;
        debug!(container = short_id(&id), "container removed");
        Ok(())
    }

    async fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        let removed = self.remove().await;
        match (outcome, removed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(error = %cleanup, "couldn't remove container");
                Err(e)
            }
        }
    }

    async fn abort<T>(&mut self, error: ContainerError) -> Result<T> {
        self.stop_quietly().await;
        self.finish(Err(error)).await
    }

    async fn remove_and_resume<T>(&mut self, panic: Box<dyn Any + Send>) -> Result<T> {
        if let Err(e) = self.remove().await {
            warn!(error = %e, "couldn't remove container");
        }
        std::panic::resume_unwind(panic)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("image", &self.image)
            .field("commit_as", &self.commit_as)
            .field("id", &self.id())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

/// Subset of the engine's `inspect` document we rely on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    pub state: ContainerState,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub exit_code: i32,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    /// Layout used by older engines: `{"Tcp": {"8080": "49153"}}` or a flat map.
    #[serde(default)]
    pub port_mapping: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

impl ContainerInfo {
    /// Published ports, container port to host port.
    pub fn port_table(&self) -> BTreeMap<u16, u16> {
        let mut table = BTreeMap::new();
        if let Some(ports) = &self.network_settings.ports {
            for (spec, bindings) in ports {
                let container_port = spec.split('/').next().and_then(|p| p.parse::<u16>().ok());
                let host_port = bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    table.insert(container_port, host_port);
                }
            }
        }
        if let Some(mapping) = &self.network_settings.port_mapping {
            legacy_port_mapping(mapping, &mut table);
        }
        table
    }
}

fn legacy_port_mapping(value: &Value, table: &mut BTreeMap<u16, u16>) {
    let Value::Object(entries) = value else {
        return;
    };
    for (key, value) in entries {
        let host_port = match value {
            Value::Object(_) => {
                legacy_port_mapping(value, table);
                continue;
            }
            Value::String(port) => port.parse::<u16>().ok(),
            Value::Number(port) => port.as_u64().and_then(|p| u16::try_from(p).ok()),
            _ => None,
        };
        if let (Ok(container_port), Some(host_port)) = (key.parse::<u16>(), host_port) {
            table.insert(container_port, host_port);
        }
    }
}

pub(crate) async fn inspect(engine: &dyn Engine, id: &str) -> Result<ContainerInfo> {
    let args = argv(&["inspect", id]);
    let out = check_output(engine, &args).await?;
    Ok(parse_inspect(engine.program(), &args, &out)?)
}

fn parse_inspect(
    program: &str,
    args: &[String],
    out: &[u8],
) -> std::result::Result<ContainerInfo, EngineError> {
    let document: Value = serde_json::from_slice(out)?;
    let document = match document {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        Value::Array(_) => {
            return Err(EngineError::MalformedOutput {
                command: command_line(program, args),
                reason: "empty inspect document".to_string(),
            })
        }
        other => other,
    };
    Ok(serde_json::from_value(document)?)
}

fn parse_container_id(program: &str, args: &[String], out: &str) -> Result<String> {
    let id = out.trim();
    if id.len() >= 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(id.to_string())
    } else {
        Err(EngineError::MalformedOutput {
            command: command_line(program, args),
            reason: format!("expected a container id, got {id:?}"),
        }
        .into())
    }
}

/// Revisions are kept in the short form the image listing prints.
fn parse_revision(program: &str, args: &[String], out: &str) -> Result<String> {
    let text = out.trim();
    let text = text.strip_prefix("sha256:").unwrap_or(text);
    if is_revision(text) {
        Ok(text[..12].to_lowercase())
    } else {
        Err(EngineError::MalformedOutput {
            command: command_line(program, args),
            reason: format!("expected an image revision, got {text:?}"),
        }
        .into())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Format a byte count with a binary unit suffix (`B`, `K`, `M`, `G`, `T`).
pub fn bytes_to_human(value: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (1 << 40, "T"),
        (1 << 30, "G"),
        (1 << 20, "M"),
        (1 << 10, "K"),
        (1, "B"),
    ];
    for (factor, suffix) in UNITS {
        if value >= factor {
            return format!("{}{}", value / factor, suffix);
        }
    }
    "0B".to_string()
}
