//! Container engine command-line seam.
//!
//! Everything the sandbox does to the engine goes through the [`Engine`]
//! trait: short commands run to completion with [`Engine::output`], long-lived
//! ones (`run -i`, `wait`, `attach`) are started with [`Engine::spawn`].
//! [`ProcessEngine`] drives a real engine binary through `tokio::process`;
//! [`crate::fakes::FakeEngine`] is the in-memory stand-in used by tests.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

/// Exit status a shell reports when the program could not be found.
const STATUS_NOT_FOUND: i32 = 127;

/// Errors produced while talking to the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine executable could not be started.
    #[error("container engine `{program}` not found (is it installed and in PATH?)")]
    NotFound { program: String },

    /// The engine ran but reported a failure.
    #[error("engine command `{command}` failed with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    /// The engine succeeded but printed something we can't interpret.
    #[error("unexpected output from `{command}`: {reason}")]
    MalformedOutput { command: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Writer end of an engine process' stdin.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader end of an engine process' (merged) output.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Captured result of an engine command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }
}

/// Which standard streams of a spawned engine process are piped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessIo {
    pub stdin: bool,
    /// Pipe stdout and stderr, merged into one reader.
    pub output: bool,
}

impl ProcessIo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn stdin_and_output() -> Self {
        Self {
            stdin: true,
            output: true,
        }
    }

    pub fn output() -> Self {
        Self {
            stdin: false,
            output: true,
        }
    }
}

/// A running engine process.
#[async_trait]
pub trait EngineProcess: Send {
    /// Take the stdin writer; dropping or shutting it down signals EOF.
    fn take_stdin(&mut self) -> Option<BoxedWriter>;

    /// Take the output reader.
    fn take_output(&mut self) -> Option<BoxedReader>;

    /// Wait for the process to exit and return its status.
    async fn wait(&mut self) -> Result<i32>;
}

/// The container engine, addressed as a command-line program.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Name of the engine program, for diagnostics.
    fn program(&self) -> &str;

    /// Run `program args...` to completion.
    async fn output(&self, args: &[String]) -> Result<EngineOutput>;

    /// Start `program args...` without waiting for it.
    async fn spawn(&self, args: &[String], io: ProcessIo) -> Result<Box<dyn EngineProcess>>;
}

/// Build an argument vector from string slices.
pub fn argv<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|a| a.as_ref().to_string()).collect()
}

/// Render a command line for error messages and logs.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run an engine command and return its stdout, failing on a nonzero status.
///
/// Status 127 is reported as [`EngineError::NotFound`], any other nonzero
/// status as [`EngineError::CommandFailed`] carrying the combined output.
pub async fn check_output(engine: &dyn Engine, args: &[String]) -> Result<Vec<u8>> {
    let output = engine.output(args).await?;
    Ok(check_status(engine.program(), args, output)?.stdout)
}

/// Like [`check_output`], but returns stdout followed by stderr.
pub async fn check_combined_output(engine: &dyn Engine, args: &[String]) -> Result<Vec<u8>> {
    let output = engine.output(args).await?;
    Ok(check_status(engine.program(), args, output)?.combined())
}

/// Map a nonzero status to the matching [`EngineError`].
pub fn check_status(program: &str, args: &[String], output: EngineOutput) -> Result<EngineOutput> {
    match output.status {
        0 => Ok(output),
        STATUS_NOT_FOUND => Err(EngineError::NotFound {
            program: program.to_string(),
        }),
        status => Err(EngineError::CommandFailed {
            command: command_line(program, args),
            status,
            output: String::from_utf8_lossy(&output.combined()).trim().to_string(),
        }),
    }
}

/// [`Engine`] backed by an executable found in `PATH` (e.g. `docker`).
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: String,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::NotFound {
                program: self.program.clone(),
            }
        } else {
            EngineError::Io(err)
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ENGINE_PROGRAM)
    }
}

impl fmt::Display for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn program(&self) -> &str {
        &self.program
    }

    async fn output(&self, args: &[String]) -> Result<EngineOutput> {
        debug!(command = %command_line(&self.program, args), "running engine command");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        Ok(EngineOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(&self, args: &[String], io: ProcessIo) -> Result<Box<dyn EngineProcess>> {
        debug!(command = %command_line(&self.program, args), "spawning engine command");
        let piped_or_null = |piped: bool| if piped { Stdio::piped() } else { Stdio::null() };
        let child = Command::new(&self.program)
            .args(args)
            .stdin(piped_or_null(io.stdin))
            .stdout(piped_or_null(io.output))
            .stderr(piped_or_null(io.output))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl EngineProcess for ChildProcess {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as BoxedWriter)
    }

    fn take_output(&mut self) -> Option<BoxedReader> {
        let stdout = self.child.stdout.take()?;
        match self.child.stderr.take() {
            Some(stderr) => {
                let merged = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
                Some(Box::new(StreamReader::new(merged)))
            }
            None => Some(Box::new(stdout)),
        }
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> EngineOutput {
        EngineOutput {
            status,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_check_status_success_keeps_output() {
        let out = check_status("docker", &argv(&["images"]), output(0, "listing", "")).unwrap();
        assert_eq!(out.stdout, b"listing");
    }

    #[test]
    fn test_check_status_127_is_not_found() {
        let err = check_status("docker", &argv(&["images"]), output(127, "", "")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { ref program } if program == "docker"));
    }

    #[test]
    fn test_check_status_failure_carries_command_and_output() {
        let err = check_status(
            "docker",
            &argv(&["rmi", "33b6d177c4bd"]),
            output(1, "", "Error: conflict\n"),
        )
        .unwrap_err();
        match err {
            EngineError::CommandFailed {
                command,
                status,
                output,
            } => {
                assert_eq!(command, "docker rmi 33b6d177c4bd");
                assert_eq!(status, 1);
                assert_eq!(output, "Error: conflict");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_combined_output_order() {
        assert_eq!(output(0, "out", "err").combined(), b"outerr");
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let engine = ProcessEngine::new("sandbox-engine-that-does-not-exist");
        let err = check_output(&engine, &argv(&["images"])).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = engine
            .spawn(&argv(&["wait", "abc"]), ProcessIo::none())
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_combined_output_keeps_stderr() {
        let engine = ProcessEngine::new("sh");
        let args = argv(&["-c", "echo out; echo err >&2"]);
        let out = check_combined_output(&engine, &args).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "out\nerr\n");
        let out = check_output(&engine, &args).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "out\n");
    }

    #[tokio::test]
    async fn test_process_engine_runs_real_program() {
        let engine = ProcessEngine::new("echo");
        let out = check_output(&engine, &argv(&["hello"])).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn test_spawned_process_streams_stdin_back() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let engine = ProcessEngine::new("cat");
        let mut process = engine
            .spawn(&[], ProcessIo::stdin_and_output())
            .await
            .unwrap();
        let mut stdin = process.take_stdin().unwrap();
        let mut output = process.take_output().unwrap();

        stdin.write_all(b"TRAVERSABLE WORMHOLE\n").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let mut received = String::new();
        output.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "TRAVERSABLE WORMHOLE\n");
        assert_eq!(process.wait().await.unwrap(), 0);
    }
}
