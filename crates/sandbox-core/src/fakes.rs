//! In-memory container engine (testing only)
//!
//! [`FakeEngine`] answers the subset of the engine command line the sandbox
//! uses (`images`, `run`, `wait`, `attach`, `logs`, `commit`, `inspect`,
//! `stop`, `rm`, `rmi`, `tag`) from an in-memory image and container table,
//! and records every invocation so tests can assert on them.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::engine::{
    BoxedReader, BoxedWriter, Engine, EngineError, EngineOutput, EngineProcess, ProcessIo, Result,
};
use crate::revspec::RevisionSpec;

const PROGRAM: &str = "fake-docker";
const FIRST_HOST_PORT: u16 = 49153;
const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// How a fake container behaves when its command matches a script.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    exit_code: i32,
    output: Vec<u8>,
    errors: Vec<u8>,
    long_running: bool,
    echo_stdin: bool,
}

impl FakeScript {
    /// Exit immediately with `code`.
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.as_bytes().to_vec();
        self
    }

    /// Text the container prints on stderr.
    pub fn with_stderr(mut self, errors: &str) -> Self {
        self.errors = errors.as_bytes().to_vec();
        self
    }

    /// Keep running until stopped; `exit_code` is then reported.
    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    /// Log whatever was written to stdin.
    pub fn echo_stdin(mut self) -> Self {
        self.echo_stdin = true;
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeImage {
    repository: Option<String>,
    tag: Option<String>,
    revision: String,
}

#[derive(Debug)]
struct FakeContainer {
    image: String,
    script: FakeScript,
    logs: Vec<u8>,
    exit_code: i32,
    running: bool,
    ports: BTreeMap<u16, u16>,
    exited: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct State {
    images: Vec<FakeImage>,
    extra_lines: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<Vec<String>>,
    scripts: Vec<(String, FakeScript)>,
    failures: HashMap<String, String>,
    spawn_failures: HashMap<String, String>,
    engine_missing: bool,
    next_id: u64,
    next_port: u16,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.next_id += 1;
        format!("a1b2c3{:06x}", self.next_id)
    }

    fn next_container_id(&mut self) -> String {
        self.next_id += 1;
        format!("c0ffee{:058x}", self.next_id)
    }

    fn allocate_port(&mut self) -> u16 {
        if self.next_port == 0 {
            self.next_port = FIRST_HOST_PORT;
        }
        let port = self.next_port;
        self.next_port += 1;
        port
    }

    fn script_for(&self, command: &[String]) -> FakeScript {
        let line = command.join(" ");
        self.scripts
            .iter()
            .find(|(matcher, _)| line.contains(matcher.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_default()
    }

    fn find_image(&self, reference: &str) -> Option<&FakeImage> {
        self.images.iter().find(|image| {
            image.revision.starts_with(reference)
                || match (&image.repository, &image.tag) {
                    (Some(repository), Some(tag)) => reference == format!("{repository}:{tag}"),
                    _ => false,
                }
        })
    }

    /// Add an image row, moving `repository:tag` away from older rows.
    fn insert_image(&mut self, repository: Option<String>, tag: Option<String>, revision: String) {
        if repository.is_some() && tag.is_some() {
            for image in &mut self.images {
                if image.repository == repository && image.tag == tag {
                    image.repository = None;
                    image.tag = None;
                }
            }
        }
        self.images.push(FakeImage {
            repository,
            tag,
            revision,
        });
    }

    fn listing(&self) -> String {
        let mut out =
            String::from("REPOSITORY          TAG                 IMAGE ID            CREATED             VIRTUAL SIZE\n");
        for line in &self.extra_lines {
            out.push_str(line);
            out.push('\n');
        }
        for image in self.images.iter().rev() {
            out.push_str(&format!(
                "{:<20}{:<20}{:<20}2 weeks ago         180.1 MB\n",
                format!("{} ", image.repository.as_deref().unwrap_or("<none>")),
                format!("{} ", image.tag.as_deref().unwrap_or("<none>")),
                image.revision,
            ));
        }
        out
    }

    fn finish_container(&mut self, id: &str, stdin: Option<Vec<u8>>) {
        if let Some(container) = self.containers.get_mut(id) {
            if let Some(stdin) = stdin {
                if container.script.echo_stdin {
                    container.logs = stdin;
                }
            }
            container.exit_code = container.script.exit_code;
            container.running = false;
            container.exited.send_replace(true);
        }
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ok(stdout: impl Into<Vec<u8>>) -> EngineOutput {
    EngineOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: Vec::new(),
    }
}

fn fail(status: i32, message: &str) -> EngineOutput {
    EngineOutput {
        status,
        stdout: Vec::new(),
        stderr: format!("Error: {message}\n").into_bytes(),
    }
}

fn split_target(target: &str) -> (Option<String>, Option<String>) {
    match target.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => {
            (Some(repository.to_string()), Some(tag.to_string()))
        }
        _ => (Some(target.to_string()), Some("latest".to_string())),
    }
}

/// Parsed `run` arguments.
#[derive(Debug, Default)]
struct RunRequest {
    detach: bool,
    ports: Vec<u16>,
    image: String,
    command: Vec<String>,
}

fn parse_run(args: &[String]) -> RunRequest {
    let mut request = RunRequest::default();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-d" => request.detach = true,
            "-t" | "-i" => {}
            "-a" | "-u" | "-e" => {
                iter.next();
            }
            "-p" => {
                if let Some(port) = iter.next().and_then(|p| p.parse().ok()) {
                    request.ports.push(port);
                }
            }
            image => {
                request.image = image.to_string();
                request.command = iter.cloned().collect();
                break;
            }
        }
    }
    request
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// In-memory [`Engine`] with scriptable container behaviour.
#[derive(Debug, Default, Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// Register an image given in human form; returns its revision.
    ///
    /// Panics if `spec` doesn't parse.
    pub fn add_image(&self, spec: &str) -> String {
        let spec = RevisionSpec::parse(spec).unwrap();
        let mut state = self.lock();
        let revision = state.next_revision();
        state.insert_image(
            spec.fully_qualified_name(),
            spec.tag().map(str::to_string),
            revision.clone(),
        );
        revision
    }

    /// Add a raw line to the image listing.
    pub fn add_listing_line(&self, line: &str) {
        self.lock().extra_lines.push(line.to_string());
    }

    /// Containers whose command line contains `matcher` follow `script`.
    pub fn script(&self, matcher: &str, script: FakeScript) {
        self.lock().scripts.push((matcher.to_string(), script));
    }

    /// Make every `verb` command fail with `message`.
    pub fn fail_command(&self, verb: &str, message: &str) {
        self.lock()
            .failures
            .insert(verb.to_string(), message.to_string());
    }

    /// Make spawning `verb` fail outright, as if the engine couldn't be
    /// started for it.
    pub fn fail_spawn(&self, verb: &str, message: &str) {
        self.lock()
            .spawn_failures
            .insert(verb.to_string(), message.to_string());
    }

    /// Behave as if the engine program wasn't installed.
    pub fn set_engine_missing(&self, missing: bool) {
        self.lock().engine_missing = missing;
    }

    /// End a running container on its own, with its script's exit code.
    pub fn exit_container(&self, id: &str) {
        self.lock().finish_container(id, None);
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, verb: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.first().map(String::as_str) == Some(verb))
            .count()
    }

    /// Containers not removed yet.
    pub fn live_containers(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Containers still running.
    pub fn running_containers(&self) -> Vec<String> {
        self.lock()
            .containers
            .iter()
            .filter(|(_, container)| container.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Image rows as `repository:tag revision`.
    pub fn images(&self) -> Vec<String> {
        self.lock()
            .images
            .iter()
            .map(|image| {
                format!(
                    "{}:{} {}",
                    image.repository.as_deref().unwrap_or("<none>"),
                    image.tag.as_deref().unwrap_or("<none>"),
                    image.revision
                )
            })
            .collect()
    }

    /// Revision tagged `repository:tag`, if any.
    pub fn tagged(&self, repository: &str, tag: &str) -> Option<String> {
        self.lock()
            .images
            .iter()
            .find(|image| {
                image.repository.as_deref() == Some(repository) && image.tag.as_deref() == Some(tag)
            })
            .map(|image| image.revision.clone())
    }

    fn create_container(&self, state: &mut State, args: &[String]) -> std::result::Result<String, EngineOutput> {
        let request = parse_run(args);
        let image = match state.find_image(&request.image) {
            Some(image) => image.revision.clone(),
            None => {
                return Err(fail(
                    125,
                    &format!("Unable to find image '{}' locally", request.image),
                ))
            }
        };
        let script = state.script_for(&request.command);
        let ports = request
            .ports
            .iter()
            .map(|port| (*port, state.allocate_port()))
            .collect();
        let id = state.next_container_id();
        let (exited, _) = watch::channel(false);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                image,
                logs: script.output.clone(),
                exit_code: 0,
                running: true,
                script,
                ports,
                exited,
            },
        );
        Ok(id)
    }

    fn run_detached(&self, state: &mut State, args: &[String]) -> EngineOutput {
        let id = match self.create_container(state, args) {
            Ok(id) => id,
            Err(failure) => return failure,
        };
        let long_running = state
            .containers
            .get(&id)
            .map(|c| c.script.long_running)
            .unwrap_or(false);
        if !long_running {
            state.finish_container(&id, None);
        }
        ok(format!("{id}\n"))
    }

    fn commit(state: &mut State, args: &[String]) -> EngineOutput {
        let Some(id) = args.get(1) else {
            return fail(1, "commit needs a container");
        };
        if !state.containers.contains_key(id) {
            return fail(1, &format!("No such container: {id}"));
        }
        let revision = state.next_revision();
        let (repository, tag) = match args.get(2) {
            Some(target) => split_target(target),
            None => (None, None),
        };
        state.insert_image(repository, tag, revision.clone());
        ok(format!("sha256:{revision}{}\n", "0".repeat(52)))
    }

    fn inspect(state: &State, args: &[String]) -> EngineOutput {
        let Some(container) = args.get(1).and_then(|id| state.containers.get(id)) else {
            return fail(1, "No such container");
        };
        let ports: serde_json::Map<String, serde_json::Value> = container
            .ports
            .iter()
            .map(|(port, host)| {
                (
                    format!("{port}/tcp"),
                    serde_json::json!([{"HostIp": "0.0.0.0", "HostPort": host.to_string()}]),
                )
            })
            .collect();
        let document = serde_json::json!([{
            "Image": container.image,
            "State": {"Running": container.running, "ExitCode": container.exit_code},
            "NetworkSettings": {"Ports": ports},
        }]);
        ok(document.to_string())
    }

    fn stop(state: &mut State, args: &[String]) -> EngineOutput {
        let Some(id) = args.last() else {
            return fail(1, "stop needs a container");
        };
        if !state.containers.contains_key(id) {
            return fail(1, &format!("No such container: {id}"));
        }
        state.finish_container(id, None);
        ok(format!("{id}\n"))
    }

    fn remove(state: &mut State, args: &[String]) -> EngineOutput {
        let Some(id) = args.get(1) else {
            return fail(1, "rm needs a container");
        };
        match state.containers.get(id) {
            None => fail(1, &format!("No such container: {id}")),
            Some(container) if container.running => {
                fail(1, "You cannot remove a running container. Stop it first")
            }
            Some(_) => {
                state.containers.remove(id);
                ok(format!("{id}\n"))
            }
        }
    }

    fn remove_image(state: &mut State, args: &[String]) -> EngineOutput {
        let Some(revision) = args.get(1) else {
            return fail(1, "rmi needs an image");
        };
        let before = state.images.len();
        state
            .images
            .retain(|image| !image.revision.starts_with(revision.as_str()));
        if state.images.len() == before {
            return fail(1, &format!("No such image: {revision}"));
        }
        ok(format!("Deleted: {revision}\n"))
    }

    fn tag(state: &mut State, args: &[String]) -> EngineOutput {
        let (Some(revision), Some(target)) = (args.get(1), args.get(2)) else {
            return fail(1, "tag needs an image and a target");
        };
        let Some(image) = state.find_image(revision).cloned() else {
            return fail(1, &format!("No such image: {revision}"));
        };
        let (repository, tag) = split_target(target);
        state.insert_image(repository, tag, image.revision);
        ok(Vec::new())
    }

    fn container_exit(&self, id: &str, report_exit_code: bool) -> FakeExit {
        match self.lock().containers.get(id) {
            Some(container) => FakeExit::Container {
                state: self.state.clone(),
                id: id.to_string(),
                exited: container.exited.subscribe(),
                report_exit_code,
            },
            None => FakeExit::Immediate(1),
        }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn program(&self) -> &str {
        PROGRAM
    }

    async fn output(&self, args: &[String]) -> Result<EngineOutput> {
        let mut state = self.lock();
        state.calls.push(args.to_vec());
        if state.engine_missing {
            return Err(EngineError::NotFound {
                program: PROGRAM.to_string(),
            });
        }
        let verb = args.first().map(String::as_str).unwrap_or_default();
        if let Some(message) = state.failures.get(verb) {
            return Ok(fail(1, message));
        }

        let output = match verb {
            "images" => ok(state.listing()),
            "run" => self.run_detached(&mut state, args),
            "logs" => match args.get(1).and_then(|id| state.containers.get(id)) {
                Some(container) => EngineOutput {
                    status: 0,
                    stdout: container.logs.clone(),
                    stderr: container.script.errors.clone(),
                },
                None => fail(1, "No such container"),
            },
            "commit" => Self::commit(&mut state, args),
            "inspect" => Self::inspect(&state, args),
            "stop" => Self::stop(&mut state, args),
            "rm" => Self::remove(&mut state, args),
            "rmi" => Self::remove_image(&mut state, args),
            "tag" => Self::tag(&mut state, args),
            other => fail(1, &format!("unknown command {other:?}")),
        };
        Ok(output)
    }

    async fn spawn(&self, args: &[String], io: ProcessIo) -> Result<Box<dyn EngineProcess>> {
        let verb = {
            let mut state = self.lock();
            state.calls.push(args.to_vec());
            if state.engine_missing {
                return Err(EngineError::NotFound {
                    program: PROGRAM.to_string(),
                });
            }
            let verb = args.first().cloned().unwrap_or_default();
            if let Some(message) = state.spawn_failures.get(&verb) {
                return Err(EngineError::Io(std::io::Error::other(message.clone())));
            }
            if let Some(message) = state.failures.get(&verb) {
                return Ok(Box::new(FakeProcess::failed(fail(1, message))));
            }
            verb
        };

        match verb.as_str() {
            "run" if io.stdin => Ok(Box::new(self.spawn_attached_run(args))),
            "run" => {
                let output = {
                    let mut state = self.lock();
                    self.run_detached(&mut state, args)
                };
                let mut process = FakeProcess::exited(output.status);
                process.output = Some(Box::new(Cursor::new(output.stdout)));
                Ok(Box::new(process))
            }
            "wait" => {
                let id = args.get(1).cloned().unwrap_or_default();
                Ok(Box::new(FakeProcess::new(self.container_exit(&id, false))))
            }
            "attach" => {
                let id = args.get(1).cloned().unwrap_or_default();
                Ok(Box::new(self.spawn_attach(&id)))
            }
            _ => Ok(Box::new(FakeProcess::exited(1))),
        }
    }
}

impl FakeEngine {
    fn spawn_attached_run(&self, args: &[String]) -> FakeProcess {
        let id = {
            let mut state = self.lock();
            match self.create_container(&mut state, args) {
                Ok(id) => id,
                Err(failure) => return FakeProcess::failed(failure),
            }
        };

        let (caller, mut inner) = tokio::io::duplex(PIPE_CAPACITY);
        let state = self.state.clone();
        let container_id = id.clone();
        tokio::spawn(async move {
            let mut stdin = Vec::new();
            let _ = inner.read_to_end(&mut stdin).await;
            lock_state(&state).finish_container(&container_id, Some(stdin));
        });

        let mut process = FakeProcess::new(self.container_exit(&id, true));
        process.stdin = Some(Box::new(caller));
        process.output = Some(Box::new(Cursor::new(format!("{id}\n").into_bytes())));
        process
    }

    fn spawn_attach(&self, id: &str) -> FakeProcess {
        let logs = match self.lock().containers.get(id) {
            Some(container) => [container.logs.as_slice(), &container.script.errors].concat(),
            None => return FakeProcess::exited(1),
        };
        let exit = self.container_exit(id, true);
        let mut exited = match &exit {
            FakeExit::Container { exited, .. } => exited.clone(),
            FakeExit::Immediate(_) => return FakeProcess::exited(1),
        };

        let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            let _ = writer.write_all(&logs).await;
            let _ = exited.wait_for(|done| *done).await.is_ok();
        });

        let mut process = FakeProcess::new(exit);
        process.output = Some(Box::new(reader));
        process
    }
}

// ---------------------------------------------------------------------------
// FakeProcess
// ---------------------------------------------------------------------------

enum FakeExit {
    Immediate(i32),
    Container {
        state: Arc<Mutex<State>>,
        id: String,
        exited: watch::Receiver<bool>,
        report_exit_code: bool,
    },
}

struct FakeProcess {
    stdin: Option<BoxedWriter>,
    output: Option<BoxedReader>,
    exit: FakeExit,
}

impl FakeProcess {
    fn new(exit: FakeExit) -> Self {
        Self {
            stdin: None,
            output: None,
            exit,
        }
    }

    fn exited(status: i32) -> Self {
        Self::new(FakeExit::Immediate(status))
    }

    /// Exits with the status of `failure`, printing its output.
    fn failed(failure: EngineOutput) -> Self {
        let mut process = Self::exited(failure.status);
        process.output = Some(Box::new(Cursor::new(failure.combined())));
        process
    }
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    fn take_output(&mut self) -> Option<BoxedReader> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32> {
        match &mut self.exit {
            FakeExit::Immediate(status) => Ok(*status),
            FakeExit::Container {
                state,
                id,
                exited,
                report_exit_code,
            } => {
                let _ = exited.wait_for(|done| *done).await.is_ok();
                if !*report_exit_code {
                    return Ok(0);
                }
                let state = lock_state(state);
                Ok(state.containers.get(id.as_str()).map_or(0, |c| c.exit_code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{argv, check_output};

    #[tokio::test]
    async fn test_listing_round_trips_through_parser() {
        let engine = FakeEngine::new();
        let revision = engine.add_image("lopter/raring-base:latest");
        engine.add_image("ubuntu:12.04");

        let listing = check_output(&engine, &argv(&["images"])).await.unwrap();
        let listing = String::from_utf8(listing).unwrap();
        let specs: Vec<RevisionSpec> = listing
            .lines()
            .skip(1)
            .map(|line| RevisionSpec::parse_from_engine_listing(line).unwrap())
            .collect();
        assert_eq!(specs.len(), 2);
        assert!(specs
            .iter()
            .any(|spec| spec.revision() == Some(revision.as_str())
                && spec.owner() == Some("lopter")
                && spec.tag() == Some("latest")));
    }

    #[tokio::test]
    async fn test_tag_moves_to_newest_image() {
        let engine = FakeEngine::new();
        let first = engine.add_image("app-api:latest");
        let second = engine.add_image("app-api:latest");
        assert_ne!(first, second);
        assert_eq!(engine.tagged("app-api", "latest"), Some(second));
    }

    #[tokio::test]
    async fn test_detached_run_then_wait() {
        let engine = FakeEngine::new();
        let revision = engine.add_image("ubuntu:12.04");
        engine.script("false", FakeScript::exit(1));

        let id = check_output(&engine, &argv(&["run", "-t", "-d", revision.as_str(), "false"]))
            .await
            .unwrap();
        let id = String::from_utf8(id).unwrap().trim().to_string();

        let mut waiter = engine
            .spawn(&argv(&["wait", id.as_str()]), ProcessIo::none())
            .await
            .unwrap();
        assert_eq!(waiter.wait().await.unwrap(), 0);
        assert!(engine.running_containers().is_empty());
        assert_eq!(engine.live_containers(), vec![id]);
    }

    #[tokio::test]
    async fn test_running_container_cant_be_removed() {
        let engine = FakeEngine::new();
        let revision = engine.add_image("ubuntu:12.04");
        engine.script("sleep", FakeScript::exit(0).long_running());

        let id = check_output(&engine, &argv(&["run", "-d", revision.as_str(), "sleep", "1d"]))
            .await
            .unwrap();
        let id = String::from_utf8(id).unwrap().trim().to_string();

        assert!(check_output(&engine, &argv(&["rm", id.as_str()])).await.is_err());
        check_output(&engine, &argv(&["stop", "-t", "10", id.as_str()]))
            .await
            .unwrap();
        check_output(&engine, &argv(&["rm", id.as_str()])).await.unwrap();
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_image_fails_run() {
        let engine = FakeEngine::new();
        let out = engine
            .output(&argv(&["run", "-d", "deadbeefdead", "true"]))
            .await
            .unwrap();
        assert_eq!(out.status, 125);
    }
}
