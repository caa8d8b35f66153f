//! Test support utilities shared across unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::messaging::{
    ConnectOptions, MessageHandler, MessagingError, MessagingFuture, MessagingService, dispatch,
};
use crate::ssh::{CommandRunner, RawOutput, RunnerFuture, SshConfig, SshError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic `ssh`/`scp` outcomes without spawning
/// processes. Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<RawOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
    detached: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// The last argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all awaited invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remote commands sent over `ssh`, excluding control-master teardown.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .filter(|inv| inv.program == "ssh" && !inv.args.iter().any(|arg| arg == "-O"))
            .map(CommandInvocation::last_arg)
            .collect()
    }

    /// Returns invocations started through [`CommandRunner::run_detached`].
    #[must_use]
    pub fn detached(&self) -> Vec<CommandInvocation> {
        self.detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of responses still queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes the `echo ping` reply that verifies a new session.
    pub fn push_ping(&self) {
        self.push_stdout("ping\n");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push_raw(RawOutput {
            code,
            stdout: stdout.into().into_bytes(),
            stderr: stderr.into().into_bytes(),
        });
    }

    /// Pushes undecoded output, for example invalid UTF-8.
    pub fn push_raw(&self, output: RawOutput) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(output);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Box::pin(async move {
            next.ok_or_else(|| SshError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }

    fn run_detached(&self, program: &str, args: &[OsString]) {
        self.detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
    }
}

/// SSH configuration pointing at a fictional login node.
#[must_use]
pub fn ssh_config() -> SshConfig {
    SshConfig {
        host: String::from("login.hpc.example"),
        user: String::from("svc"),
        port: 22,
        identity_file: Some(String::from("/keys/id_ed25519")),
        known_hosts_file: Some(String::from("/keys/known_hosts")),
        strict_host_key_checking: true,
        batch_mode: true,
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        control_dir: String::from("/tmp"),
        control_persist_seconds: 300,
        keepalive_interval_seconds: 30,
        max_channels: 4,
    }
}

/// Formats `squeue --format='%i|%j|%T'` output with its header line.
#[must_use]
pub fn squeue_output(rows: &[(u64, &str, &str)]) -> String {
    let mut out = String::from("JOBID|NAME|STATE\n");
    for (job_id, name, state) in rows {
        out.push_str(&format!("{job_id}|{name}|{state}\n"));
    }
    out
}

/// Formats `sacct --parsable2` output for the fields the Slurm service
/// requests, including the header line.
#[must_use]
pub fn sacct_output(rows: &[(&str, &str, &str, &str)]) -> String {
    let mut out = String::from("JobIDRaw|JobName|State|ExitCode|Start|End|Elapsed\n");
    for (job_id, name, state, exit_code) in rows {
        out.push_str(&format!(
            "{job_id}|{name}|{state}|{exit_code}|2026-01-01T00:00:00|2026-01-01T00:10:00|00:10:00\n"
        ));
    }
    out
}

/// In-process [`MessagingService`] that delivers each publish to the
/// handlers registered for its subject before `publish` returns.
///
/// Like the network backends it keeps no history, so a subscription only
/// sees messages published after it was registered.
#[derive(Default)]
pub struct MemoryMessagingService {
    connected: AtomicBool,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl std::fmt::Debug for MemoryMessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMessagingService")
            .field("connected", &self.is_connected())
            .field("published", &self.published().len())
            .finish_non_exhaustive()
    }
}

impl MemoryMessagingService {
    /// Creates a disconnected service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service that is already connected.
    #[must_use]
    pub fn connected() -> Self {
        let service = Self::default();
        service.connected.store(true, Ordering::Release);
        service
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MessagingError::NotConnected { backend: "memory" })
        }
    }
}

impl MessagingService for MemoryMessagingService {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
        _options: &'a ConnectOptions,
    ) -> MessagingFuture<'a, ()> {
        self.connected.store(true, Ordering::Release);
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> MessagingFuture<'_, ()> {
        self.connected.store(false, Ordering::Release);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Box::pin(async { Ok(()) })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((subject.to_owned(), payload.clone()));
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(subject)
                .cloned()
                .unwrap_or_default();
            for handler in &handlers {
                dispatch(subject, handler, payload.clone()).await;
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        handler: MessageHandler,
    ) -> MessagingFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(subject.to_owned())
                .or_default()
                .push(handler);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
