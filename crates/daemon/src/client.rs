//! Automation agent protocol client
//!
//! Writes newline-delimited JSON commands to the agent's stdin and
//! demultiplexes its stdout by `command_id`. Any number of commands may be in
//! flight; each one resolves independently.

use crate::notify::Notifier;
use crate::supervisor::SupervisorEvent;
use agenticqa_common::protocol::Line;
use agenticqa_common::{
    BridgeEvent, Error, InboundMessage, LineBuffer, OutboundCommand, ReadinessSource, Result,
    SubprocessState,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

type Reply = Result<serde_json::Value>;
type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub command_timeout: Duration,
    pub max_line_bytes: usize,
    pub ready_patterns: Vec<String>,
}

/// Correlating client for the agent wire protocol
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    next_id: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    writer: parking_lot::Mutex<Option<Attached>>,
    state: watch::Receiver<SubprocessState>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    notifier: Notifier,
}

/// Stdin of the currently attached process
#[derive(Clone)]
struct Attached {
    generation: u64,
    stdin: Arc<tokio::sync::Mutex<AgentWriter>>,
}

/// Removes a pending entry when its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Reply>>,
    command_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.command_id);
    }
}

impl ProtocolClient {
    pub fn new(
        options: ClientOptions,
        state: watch::Receiver<SubprocessState>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                writer: parking_lot::Mutex::new(None),
                state,
                events,
                notifier,
            }),
        }
    }

    /// Bind to a freshly spawned process and start reading its output.
    pub fn attach<W, R>(&self, generation: u64, stdin: W, stdout: R)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        *self.inner.writer.lock() = Some(Attached {
            generation,
            stdin: Arc::new(tokio::sync::Mutex::new(Box::new(stdin))),
        });

        let client = self.clone();
        tokio::spawn(async move {
            client.read_loop(generation, stdout).await;
        });
    }

    /// Drop the writer of an exited process and reject everything in flight.
    pub fn detach(&self, generation: u64) {
        {
            let mut writer = self.inner.writer.lock();
            if writer.as_ref().map(|w| w.generation) == Some(generation) {
                *writer = None;
            }
        }
        self.fail_all();
    }

    /// Reject every pending command with [`Error::SubprocessExited`].
    pub fn fail_all(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(Error::SubprocessExited));
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("Rejected {} pending commands: agent exited", failed);
        }
        failed
    }

    /// Number of commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, command_id: &str) -> bool {
        self.inner.pending.contains_key(command_id)
    }

    /// Send one command and wait for its reply payload.
    pub async fn send<P: Serialize>(&self, command: &str, payload: P) -> Result<serde_json::Value> {
        let state = *self.inner.state.borrow();
        if !state.is_live() {
            return Err(Error::Unavailable(format!("agent is {}", state)));
        }
        let attached = self
            .inner
            .writer
            .lock()
            .clone()
            .ok_or_else(|| Error::Unavailable("no agent process attached".to_string()))?;

        let command_id = format!("cmd_{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let line = OutboundCommand {
            command_id: command_id.clone(),
            command: command.to_string(),
            payload,
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(command_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            command_id: command_id.clone(),
        };

        // Written from a separate task so a timed-out caller never leaves a
        // partial line on the pipe. The task ends once the agent reads or dies.
        let stdin = attached.stdin.clone();
        let write = tokio::spawn(async move {
            let mut stdin = stdin.lock().await;
            stdin.write_all(&line).await?;
            stdin.flush().await
        });

        let exchange = async {
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(command_id = %command_id, "agent stdin write failed: {}", e);
                    return Err(Error::Unavailable(format!("agent stdin closed: {}", e)));
                }
                Err(e) => return Err(Error::Internal(format!("stdin writer failed: {}", e))),
            }
            debug!(command_id = %command_id, command = %command, "command sent");
            rx.await.unwrap_or(Err(Error::SubprocessExited))
        };

        let timeout = self.inner.options.command_timeout;
        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(reply) => {
                if reply.is_ok() {
                    self.notify(SupervisorEvent::CommandSucceeded {
                        generation: attached.generation,
                    });
                }
                reply
            }
            Err(_) => {
                warn!(command_id = %command_id, "no reply within {:?}", timeout);
                self.notify(SupervisorEvent::CommandTimedOut {
                    generation: attached.generation,
                });
                Err(Error::ProtocolTimeout {
                    command_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(&self, generation: u64, mut stdout: R) {
        let mut lines = LineBuffer::new(self.inner.options.max_line_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.push(&chunk[..n]) {
                        match line {
                            Line::Text(text) => self.handle_line(generation, &text),
                            Line::Oversized(len) => {
                                warn!("Discarded {} byte line from agent (limit {})", len, self.inner.options.max_line_bytes)
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to read agent output: {}", e);
                    break;
                }
            }
        }

        if let Some(rest) = lines.finish() {
            self.handle_line(generation, &rest);
        }
        debug!(generation, "agent stdout closed");
    }

    /// Route one line of agent output.
    pub(crate) fn handle_line(&self, generation: u64, line: &str) {
        match InboundMessage::decode(line) {
            Ok(InboundMessage::Reply {
                command_id,
                payload,
            }) => self.resolve(&command_id, Ok(payload)),
            Ok(InboundMessage::ErrorReply {
                command_id,
                message,
            }) => self.resolve(&command_id, Err(Error::Remote(message))),
            Ok(InboundMessage::Ready) => self.notify(SupervisorEvent::ReadySignal {
                generation,
                source: ReadinessSource::StatusMessage,
            }),
            Ok(InboundMessage::Event { name, data }) => {
                self.inner
                    .notifier
                    .broadcast(&BridgeEvent::AgentEvent { event: name, data });
            }
            Ok(InboundMessage::Unrecognized(value)) => {
                debug!("Ignoring unrecognized agent message: {}", value);
            }
            Err(e) => {
                if self.matches_ready_pattern(line) {
                    self.notify(SupervisorEvent::ReadySignal {
                        generation,
                        source: ReadinessSource::OutputMatch,
                    });
                } else if line.starts_with('{') || line.starts_with('[') {
                    warn!("{}", e);
                } else {
                    info!(target: "agent", "{}", line);
                }
            }
        }
    }

    pub(crate) fn matches_ready_pattern(&self, line: &str) -> bool {
        self.inner
            .options
            .ready_patterns
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
    }

    fn resolve(&self, command_id: &str, reply: Reply) {
        match self.inner.pending.remove(command_id) {
            Some((_, tx)) => {
                trace!(command_id = %command_id, "reply matched");
                let _ = tx.send(reply);
            }
            None => warn!(command_id = %command_id, "reply for unknown command"),
        }
    }

    fn notify(&self, event: SupervisorEvent) {
        // Receiver gone means the bridge is shutting down.
        let _ = self.inner.events.send(event);
    }
}
