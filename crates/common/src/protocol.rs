//! Automation agent wire protocol
//!
//! Line-delimited JSON over the agent's stdin/stdout. Every outbound command
//! carries a `command_id`; replies echo it back and may arrive in any order.

use crate::types::{Screenshot, StepDescriptor, StepStatus, TestDefinition, ValidationVerdict};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Event names that announce agent readiness
pub const READY_EVENTS: &[&str] = &["mcp_ready", "ready"];

/// Outbound command envelope
#[derive(Debug, Clone, Serialize)]
pub struct OutboundCommand<P = CommandPayload> {
    pub command_id: String,
    pub command: String,
    pub payload: P,
}

impl<P: Serialize> OutboundCommand<P> {
    /// Serialize as one newline-terminated JSON line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Test payload of a command
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandPayload {
    pub test_name: String,
    pub test_module: String,
    pub steps: Vec<WireStep>,
    pub expected_results_description: String,
    pub options: CommandOptions,
}

impl CommandPayload {
    pub fn new(test: &TestDefinition, steps: &[StepDescriptor], options: CommandOptions) -> Self {
        Self {
            test_name: test.name.clone(),
            test_module: test.module.clone(),
            steps: steps.iter().map(WireStep::from).collect(),
            expected_results_description: test.expected_results.clone(),
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CommandOptions {
    pub capture_screenshots_for_steps: bool,
    pub validate_results_against_description: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            capture_screenshots_for_steps: true,
            validate_results_against_description: true,
        }
    }
}

/// Step as it appears on the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireStep {
    pub step_number: u32,
    pub action: String,
    pub options: serde_json::Value,
    pub description: String,
}

impl From<&StepDescriptor> for WireStep {
    fn from(step: &StepDescriptor) -> Self {
        Self {
            step_number: step.step_number,
            action: step.kind().to_string(),
            options: step.action.options(),
            description: step.description.clone(),
        }
    }
}

/// Explicit discriminator an agent may put on its messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MessageKind {
    Reply,
    Error,
    Event,
    Ready,
}

/// Raw shape of any inbound line, before classification
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    kind: Option<MessageKind>,
    #[serde(default)]
    command_id: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    event: Option<String>,
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Successful reply to a pending command
    Reply {
        command_id: String,
        payload: serde_json::Value,
    },
    /// Error reply to a pending command
    ErrorReply { command_id: String, message: String },
    /// Readiness announcement
    Ready,
    /// Any other named event
    Event {
        name: String,
        data: serde_json::Value,
    },
    /// Valid JSON that fits none of the above
    Unrecognized(serde_json::Value),
}

impl InboundMessage {
    /// Decode one line of agent output.
    pub fn decode(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| Error::MalformedMessage(format!("{}: {}", e, truncate(line, 120))))?;
        trace!("agent message: {}", line);
        Ok(Self::classify(value))
    }

    fn classify(value: serde_json::Value) -> Self {
        let envelope: Envelope = match serde_json::from_value(value.clone()) {
            Ok(envelope) => envelope,
            Err(_) => return InboundMessage::Unrecognized(value),
        };

        match (envelope.kind, envelope.command_id, envelope.error, envelope.event) {
            (Some(MessageKind::Ready), _, _, _) => InboundMessage::Ready,
            (Some(MessageKind::Event), _, _, Some(name)) | (None, None, None, Some(name)) => {
                if READY_EVENTS.contains(&name.as_str()) {
                    InboundMessage::Ready
                } else {
                    InboundMessage::Event { name, data: value }
                }
            }
            (Some(MessageKind::Error), Some(command_id), error, _)
            | (None, Some(command_id), error @ Some(_), _) => InboundMessage::ErrorReply {
                command_id,
                message: error_message(error.as_ref()),
            },
            (Some(MessageKind::Reply), Some(command_id), _, _) | (None, Some(command_id), None, _) => {
                InboundMessage::Reply {
                    command_id,
                    payload: envelope.payload.unwrap_or(serde_json::Value::Null),
                }
            }
            (Some(MessageKind::Event), _, _, None)
            | (Some(MessageKind::Reply | MessageKind::Error), None, _, _)
            | (None, None, _, None) => InboundMessage::Unrecognized(value),
            (None, None, Some(_), Some(_)) => InboundMessage::Unrecognized(value),
        }
    }
}

fn error_message(error: Option<&serde_json::Value>) -> String {
    match error {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(value) => value
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        None => "unspecified error".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Payload of a successful reply
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub overall_status: Option<String>,
    #[serde(default)]
    pub total_duration_ms: Option<u64>,
    #[serde(default)]
    pub step_results: Vec<WireStepResult>,
    #[serde(default)]
    pub validation_outcome: Option<ValidationOutcome>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ReplyPayload {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::MalformedMessage(format!("invalid reply payload: {}", e)))
    }

    /// Result entry for a given step, if the agent reported one.
    pub fn step(&self, step_number: u32) -> Option<&WireStepResult> {
        self.step_results.iter().find(|r| r.step_number == step_number)
    }
}

/// Per-step entry of a reply
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WireStepResult {
    #[serde(default)]
    pub step_number: u32,
    #[serde(default)]
    pub action_performed: Option<String>,
    #[serde(default)]
    pub screenshot_path: Option<String>,
    #[serde(default)]
    pub screenshot_base64: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WireStepResult {
    pub fn step_status(&self) -> Option<StepStatus> {
        self.status.as_deref().map(StepStatus::from_wire)
    }

    pub fn screenshot(&self) -> Option<Screenshot> {
        match (&self.screenshot_base64, &self.screenshot_path) {
            (Some(data), _) => Some(Screenshot::Base64(data.clone())),
            (None, Some(path)) => Some(Screenshot::Path(path.clone())),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ValidationOutcome {
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub details: Option<String>,
}

impl From<ValidationOutcome> for ValidationVerdict {
    fn from(outcome: ValidationOutcome) -> Self {
        Self {
            passed: outcome.passed,
            details: outcome
                .details
                .unwrap_or_else(|| "No validation details.".to_string()),
        }
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are buffered until a `\n` arrives; a trailing `\r` is dropped and
/// blank lines are skipped. A line longer than `max_line_bytes` is discarded
/// up to its terminating newline.
///
/// Hand-rolled rather than a `LinesCodec`: a framed reader ends the stream on
/// its max-length error, while the agent connection must survive one bad line.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
    discarded: usize,
}

/// Output of [`LineBuffer::push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// A line over the length limit was dropped; carries its length in bytes
    Oversized(usize),
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
            discarded: 0,
        }
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let (head, tail) = rest.split_at(idx);
                    rest = &tail[1..];
                    if self.discarding {
                        lines.push(Line::Oversized(self.discarded + head.len()));
                        self.discarding = false;
                        self.discarded = 0;
                        continue;
                    }
                    self.buf.extend_from_slice(head);
                    if self.buf.len() > self.max_line_bytes {
                        lines.push(Line::Oversized(self.buf.len()));
                        self.buf.clear();
                        continue;
                    }
                    if let Some(line) = self.take_line() {
                        lines.push(Line::Text(line));
                    }
                }
                None => {
                    if self.discarding {
                        self.discarded += rest.len();
                    } else {
                        self.buf.extend_from_slice(rest);
                        if self.buf.len() > self.max_line_bytes {
                            self.discarding = true;
                            self.discarded = self.buf.len();
                            self.buf.clear();
                        }
                    }
                    rest = &[];
                }
            }
        }

        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.discarding {
            self.discarding = false;
            return None;
        }
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}
