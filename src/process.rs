//! Child-process worker endpoints.
//!
//! [`ProcessFactory`] spawns a worker binary per connection attempt and
//! talks to it via NDJSON (newline-delimited JSON) over stdin/stdout: one
//! envelope per line. stderr is inherited so worker diagnostics reach the
//! terminal. The worker process is expected to honor the constructor-first
//! contract on its side.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::endpoint::{ContextHandle, Endpoint, EndpointEvent, WorkerFactory, ENDPOINT_BUFFER};
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::WireMessage;

/// Factory spawning a worker binary per connection attempt.
pub struct ProcessFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessFactory {
    /// Create a factory for the given worker binary.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra command-line arguments passed to the worker on spawn.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Build a factory from settings, resolving the worker binary path.
    ///
    /// # Errors
    ///
    /// Returns an error if no worker binary can be located.
    pub fn from_settings(settings: &Settings) -> WorkerResult<Self> {
        let program = resolve_worker_path(settings)?;
        Ok(Self {
            program,
            args: settings.worker.args.clone(),
        })
    }

    /// The worker binary this factory spawns.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerFactory for ProcessFactory {
    async fn create(&self) -> WorkerResult<Endpoint> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::SpawnFailed)?;

        let stdin = child.stdin.take().expect("stdin not captured");
        let stdout = child.stdout.take().expect("stdout not captured");

        let (sender, outbound) = mpsc::channel(ENDPOINT_BUFFER);
        let (events_tx, events) = mpsc::channel(ENDPOINT_BUFFER);

        spawn_writer_task(stdin, outbound);
        spawn_reader_task(stdout, events_tx);

        Ok(Endpoint {
            sender,
            events,
            context: Box::new(ProcessContext { child }),
        })
    }
}

/// Terminates the worker process.
struct ProcessContext {
    child: Child,
}

impl ContextHandle for ProcessContext {
    fn terminate(&mut self) {
        // Reaping happens in the background via kill_on_drop.
        if let Err(err) = self.child.start_kill() {
            debug!(%err, "failed to kill worker process");
        }
    }
}

/// Serialize outbound envelopes to the worker's stdin, one per line.
fn spawn_writer_task(stdin: ChildStdin, mut outbound: mpsc::Receiver<WireMessage>) {
    tokio::spawn(async move {
        let mut stdin = BufWriter::new(stdin);
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "failed to serialize envelope, dropping");
                    continue;
                }
            };
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
}

/// Parse inbound NDJSON lines into events. EOF or a read error is a fault;
/// unparseable lines (including unrecognized envelope kinds) are logged and
/// skipped.
fn spawn_reader_task(stdout: ChildStdout, events: mpsc::Sender<EndpointEvent>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // EOF - worker exited
                    let _ = events
                        .send(EndpointEvent::Fault(
                            "worker process exited unexpectedly".to_string(),
                        ))
                        .await;
                    break;
                }
                Ok(_) => match serde_json::from_str::<WireMessage>(&line) {
                    Ok(message) => {
                        if events.send(EndpointEvent::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "failed to parse worker envelope, ignoring");
                    }
                },
                Err(err) => {
                    let _ = events
                        .send(EndpointEvent::Fault(format!(
                            "failed to read from worker: {err}"
                        )))
                        .await;
                    break;
                }
            }
        }
    });
}

/// Resolve the worker binary path from settings.
///
/// Tries the configured path first, then conventional locations, then
/// `PATH`.
fn resolve_worker_path(settings: &Settings) -> WorkerResult<PathBuf> {
    if let Ok(Some(path)) = settings.worker_path() {
        return Ok(path);
    }

    let candidates = [
        "tether-worker",
        "./tether-worker",
        "./worker/tether-worker",
    ];
    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(output) = std::process::Command::new("which")
        .arg("tether-worker")
        .output()
    {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    Err(WorkerError::WorkerNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProcessFactory>();
    }

    #[test]
    fn test_configured_path_wins() {
        let settings = Settings::from_toml(
            r#"
[worker]
path = "/opt/workers/tether-worker"
"#,
        )
        .unwrap();

        let factory = ProcessFactory::from_settings(&settings).unwrap();
        assert_eq!(
            factory.program(),
            &PathBuf::from("/opt/workers/tether-worker")
        );
    }
}
