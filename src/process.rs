//! Serialized execution of calibredb.
//!
//! calibredb corrupts its library when two invocations overlap, so every
//! call goes through one lock owned by the [`ProcessGateway`] instance. The
//! lock is held from before the child is spawned until it has exited (or been
//! killed on timeout); the guard drops on every return path.
//!
//! Children never inherit the server's environment. Only the variables handed
//! to [`ProcessGateway::new`] are set, so behaviour does not drift between
//! deployments.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, warn};

use crate::error::{GatewayError, Result};
use crate::flags::CommandLine;

/// Printed by calibre when another program holds the library.
static ANOTHER_INSTANCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)another calibre program.*?is running").unwrap());

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

pub struct ProcessGateway {
    lock: Mutex<()>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl ProcessGateway {
    /// `timeout` of `None` waits for the child indefinitely.
    pub fn new(env: Vec<(String, String)>, timeout: Option<Duration>) -> Self {
        Self {
            lock: Mutex::new(()),
            env,
            timeout,
        }
    }

    /// Run `cmd` to completion and return its decoded output.
    ///
    /// Fails with [`GatewayError::ExecutableNotFound`] when the program cannot
    /// be spawned, [`GatewayError::ConcurrencyConflict`] when calibre reports
    /// another instance, [`GatewayError::Timeout`] when the configured timeout
    /// elapses, and [`GatewayError::Runtime`] for any other non-zero exit.
    /// Stderr on a zero exit is logged and otherwise ignored.
    pub fn execute(&self, cmd: &CommandLine) -> Result<ProcessOutput> {
        // A panic in another caller leaves nothing inconsistent behind the unit lock.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        debug!(command = %cmd, "Running calibredb");
        let (status, output) = self.spawn_and_wait(cmd)?;

        if status.success() {
            if !output.stderr.trim().is_empty() {
                warn!(command = %cmd, "{}", output.stderr.trim_end());
            }
            return Ok(output);
        }

        let command = cmd.to_string();
        if ANOTHER_INSTANCE_RE.is_match(&output.stderr) {
            warn!(%command, "calibre library is busy");
            return Err(GatewayError::ConcurrencyConflict {
                command,
                stderr: output.stderr,
            });
        }

        let exit_code = status.code().unwrap_or(-1);
        error!(
            %command,
            exit_code,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "calibredb failed"
        );
        Err(GatewayError::Runtime {
            command,
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn_and_wait(&self, cmd: &CommandLine) -> Result<(ExitStatus, ProcessOutput)> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    GatewayError::ExecutableNotFound {
                        program: cmd.program.clone(),
                        source,
                    }
                } else {
                    GatewayError::Io(source)
                }
            })?;

        // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // A timeout too large to represent as an instant waits forever.
        let deadline = self
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout).map(|d| (timeout, d)));
        let status = match deadline {
            None => child.wait()?,
            Some((timeout, deadline)) => {
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let command = cmd.to_string();
                        error!(%command, "calibredb timed out after {}s", timeout.as_secs());
                        return Err(GatewayError::Timeout { command, timeout });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let output = ProcessOutput {
            stdout: decode(stdout.join().unwrap_or_default()),
            stderr: decode(stderr.join().unwrap_or_default()),
        };
        Ok((status, output))
    }
}

fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn decode(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}
