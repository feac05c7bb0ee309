//! Per-channel request handling.
//!
//! Each accepted `session` channel gets its own [`ChannelDispatcher`] task.
//! The dispatcher collects `env` requests, services exactly one `exec`
//! request, and always closes the channel before it goes away.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, instrument, warn};

use super::env::ChannelEnv;
use crate::git::relay::{self, OutputSink, EXIT_UNKNOWN};
use crate::AppState;

/// SSH extended-data type code for stderr (RFC 4254 §5.2).
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

// ---------------------------------------------------------------------------
// Close guard
// ---------------------------------------------------------------------------

/// Closes the channel when dropped unless [`CloseGuard::finish`] ran first.
struct CloseGuard {
    handle: Handle,
    id: ChannelId,
    finished: bool,
}

impl CloseGuard {
    fn new(handle: Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            finished: false,
        }
    }

    /// Send exit-status (when there is one), EOF, and close, in the order
    /// git's SSH transport expects.
    async fn finish(mut self, exit_status: Option<u32>) {
        self.finished = true;
        if let Some(code) = exit_status {
            if self.handle.exit_status_request(self.id, code).await.is_err() {
                debug!(channel = ?self.id, "failed to send exit-status");
            }
        }
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let handle = self.handle.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = handle.close(id).await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Writes child output onto the channel: stdout as data, stderr as
/// extended data.
struct ChannelSink {
    handle: Handle,
    id: ChannelId,
}

#[async_trait::async_trait]
impl OutputSink for ChannelSink {
    async fn stdout(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("channel {:?} no longer accepts data", self.id))
    }

    async fn stderr(&self, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.id, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(data))
            .await
            .map_err(|_| anyhow!("channel {:?} no longer accepts data", self.id))
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ChannelDispatcher {
    state: Arc<AppState>,
    handle: Handle,
    channel: Channel<Msg>,
    env: ChannelEnv,
    guard: CloseGuard,
    /// Slot in the session's channel limit, released when the task ends.
    permit: OwnedSemaphorePermit,
}

impl ChannelDispatcher {
    pub fn new(
        state: Arc<AppState>,
        handle: Handle,
        channel: Channel<Msg>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let guard = CloseGuard::new(handle.clone(), channel.id());
        Self {
            state,
            handle,
            channel,
            env: ChannelEnv::default(),
            guard,
            permit,
        }
    }

    /// Process channel requests until an exec has been serviced or the
    /// client gives up on the channel.
    #[instrument(skip(self), fields(channel = ?self.channel.id()))]
    pub async fn run(mut self) {
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::SetEnv {
                    variable_name,
                    variable_value,
                    ..
                } => self.on_env(&variable_name, &variable_value),
                ChannelMsg::Exec {
                    want_reply,
                    command,
                } => return self.on_exec(want_reply, &command).await,
                ChannelMsg::RequestShell { want_reply }
                | ChannelMsg::RequestSubsystem { want_reply, .. }
                | ChannelMsg::RequestPty { want_reply, .. } => {
                    warn!("refusing non-exec channel request");
                    self.reply(want_reply, false).await;
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    debug!("channel ended before exec");
                    break;
                }
                other => debug!(?other, "ignoring channel message"),
            }
        }
        self.guard.finish(None).await;
    }

    /// Record or skip an `env` request.  Never answered: russh reports every
    /// env request as wanting a reply, while OpenSSH sends `SendEnv`
    /// variables without one, so any reply would be taken as the answer to
    /// the next exec.
    fn on_env(&mut self, name: &str, value: &str) {
        match self
            .env
            .apply(name, value, &self.state.config.access.accepted_env)
        {
            Ok(()) => debug!(name, "accepted env request"),
            Err(e) => debug!(error = %e, "skipping env request"),
        }
    }

    async fn on_exec(self, want_reply: bool, command: &[u8]) {
        let id = self.channel.id();
        let payload = String::from_utf8_lossy(command).into_owned();
        info!(command = %payload, "exec request");

        let invocation = match self.state.policy.plan(&payload, self.env.vars()) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(command = %payload, error = %e, "rejected exec request");
                return self.reject(want_reply, &e.to_string()).await;
            }
        };
        debug!(argv = ?invocation.argv(), "starting pack-protocol process");

        let mut running = match relay::spawn(&invocation) {
            Ok(running) => running,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to start pack-protocol process");
                return self
                    .reject(want_reply, &format!("failed to start {}", invocation.program))
                    .await;
            }
        };
        self.reply(want_reply, true).await;

        let Self {
            handle,
            channel,
            guard,
            permit,
            ..
        } = self;

        if let Some(stdin) = running.take_stdin() {
            tokio::spawn(forward_input(channel, handle.clone(), stdin));
        }

        let sink = ChannelSink { handle, id };
        let exit_status = match running.finish(&sink).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %format!("{e:#}"), "pack-protocol process failed");
                EXIT_UNKNOWN
            }
        };
        info!(exit_status, "exec finished");

        guard.finish(Some(exit_status)).await;
        drop(permit);
    }

    /// Refuse the exec request, explain why on stderr, and close the channel
    /// without an exit status.
    async fn reject(self, want_reply: bool, reason: &str) {
        self.reply(want_reply, false).await;
        let message = format!("ERROR: {reason}\n");
        let _ = self
            .handle
            .extended_data(
                self.channel.id(),
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(message.as_bytes()),
            )
            .await;
        self.guard.finish(None).await;
    }

    async fn reply(&self, want_reply: bool, success: bool) {
        if !want_reply {
            return;
        }
        let id = self.channel.id();
        let sent = if success {
            self.handle.channel_success(id).await
        } else {
            self.handle.channel_failure(id).await
        };
        if sent.is_err() {
            debug!(channel = ?id, "failed to send channel reply");
        }
    }
}

/// Copy channel data into the child's stdin until the client sends EOF.
///
/// Keeps draining the channel afterwards so that a second exec on the same
/// channel is answered with a failure instead of going unanswered.
async fn forward_input(mut channel: Channel<Msg>, handle: Handle, stdin: ChildStdin) {
    let id = channel.id();
    let mut stdin = Some(stdin);

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if let Some(pipe) = stdin.as_mut() {
                    if let Err(e) = pipe.write_all(&data).await {
                        debug!(error = %e, "child stdin closed");
                        stdin = None;
                    }
                }
            }
            ChannelMsg::Eof => {
                // Dropping the pipe is the child's EOF.
                stdin = None;
            }
            ChannelMsg::Close => break,
            ChannelMsg::SetEnv { variable_name, .. } => {
                debug!(channel = ?id, name = %variable_name, "skipping env request after exec");
            }
            ChannelMsg::Exec { want_reply, .. }
            | ChannelMsg::RequestShell { want_reply }
            | ChannelMsg::RequestSubsystem { want_reply, .. } => {
                warn!(channel = ?id, "ignoring request after exec");
                if want_reply {
                    let _ = handle.channel_failure(id).await;
                }
            }
            _ => {}
        }
    }
}
