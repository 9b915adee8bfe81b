//! Scriptable stand-in for the browser automation agent
//!
//! Reads commands from stdin one JSON line at a time and answers on stdout
//! the way a well-behaved agent would, unless told to misbehave.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Tools reported for `list_tools`
pub const MOCK_TOOLS: &[&str] = &[
    "browser_navigate",
    "browser_click",
    "browser_type",
    "browser_wait_for",
    "browser_take_screenshot",
];

/// How the agent announces readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AgentMode {
    /// `{"event":"mcp_ready"}` on stdout
    #[default]
    Ready,
    /// A plain-text banner on stderr
    Banner,
    /// Nothing at all
    Silent,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct AgentOptions {
    /// Readiness announcement
    #[arg(long, value_enum, default_value_t = AgentMode::Ready)]
    pub mode: AgentMode,

    /// Answer commands for this step with an error reply
    #[arg(long)]
    pub fail_step: Option<u32>,

    /// Never answer commands for this step
    #[arg(long)]
    pub hang_step: Option<u32>,

    /// Exit with status 3 on receiving this (1-based) command
    #[arg(long)]
    pub crash_on: Option<usize>,

    /// Delay before every reply
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Precede replies with malformed lines, orphan replies and events
    #[arg(long)]
    pub noisy: bool,

    /// Report a validation outcome on the final screenshot
    #[arg(long)]
    pub validate: bool,
}

/// What to do with one inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Lines(Vec<String>),
    Exit(i32),
}

/// Mock agent state
pub struct MockAgent {
    options: AgentOptions,
    received: usize,
}

impl MockAgent {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            received: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.options.delay_ms)
    }

    /// Stdout lines written at startup.
    pub fn stdout_greeting(&self) -> Vec<String> {
        match self.options.mode {
            AgentMode::Ready => vec![json!({ "event": "mcp_ready" }).to_string()],
            AgentMode::Banner | AgentMode::Silent => vec![],
        }
    }

    /// Stderr lines written at startup.
    pub fn stderr_greeting(&self) -> Vec<String> {
        match self.options.mode {
            AgentMode::Banner => vec!["Playwright MCP ready (mock)".to_string()],
            AgentMode::Ready | AgentMode::Silent => vec![],
        }
    }

    /// Answer one line of input.
    pub fn handle(&mut self, line: &str) -> Response {
        let command: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!("mock agent ignoring input: {}", e);
                return Response::Lines(vec![]);
            }
        };
        self.received += 1;
        if self.options.crash_on == Some(self.received) {
            return Response::Exit(3);
        }

        let Some(command_id) = command["command_id"].as_str() else {
            return Response::Lines(vec![]);
        };
        if command["command"] == "list_tools" {
            let tools: Vec<Value> = MOCK_TOOLS.iter().map(|name| json!({ "name": name })).collect();
            return Response::Lines(vec![
                json!({ "command_id": command_id, "payload": { "tools": tools } }).to_string(),
            ]);
        }
        let steps = command["payload"]["steps"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let step_numbers: Vec<u32> = steps
            .iter()
            .filter_map(|s| s["step_number"].as_u64())
            .map(|n| n as u32)
            .collect();

        let mut lines = Vec::new();
        if self.options.noisy {
            lines.push("mock agent: this line is not JSON".to_string());
            lines.push(json!({ "command_id": "cmd_orphan", "payload": {} }).to_string());
            lines.push(json!({ "event": "console", "message": format!("handling {}", command_id) }).to_string());
        }

        if self.options.hang_step.is_some_and(|n| step_numbers.contains(&n)) {
            return Response::Lines(lines);
        }

        if let Some(step) = self.options.fail_step.filter(|n| step_numbers.contains(n)) {
            lines.push(
                json!({
                    "command_id": command_id,
                    "error": { "message": format!("mock failure at step {}", step) },
                })
                .to_string(),
            );
            return Response::Lines(lines);
        }

        let step_results: Vec<Value> = steps.iter().map(step_result).collect();
        let mut payload = json!({
            "overall_status": "passed",
            "total_duration_ms": step_results.len(),
            "step_results": step_results,
            "logs": [format!("mock agent ran {} for {}", command["command"], command["payload"]["test_name"])],
        });
        let has_final = steps
            .iter()
            .any(|s| s["options"]["name"].as_str() == Some("final"));
        if self.options.validate && has_final {
            payload["validation_outcome"] = json!({
                "passed": true,
                "details": format!("Observed: {}", command["payload"]["expected_results_description"].as_str().unwrap_or("")),
            });
        }

        lines.push(json!({ "command_id": command_id, "payload": payload }).to_string());
        Response::Lines(lines)
    }
}

fn step_result(step: &Value) -> Value {
    let number = step["step_number"].as_u64().unwrap_or(0);
    let action = step["action"].as_str().unwrap_or("unknown");
    let mut result = json!({
        "step_number": number,
        "action_performed": step["description"],
        "status": "success",
        "duration_ms": 1,
        "logs": [format!("{} ok", action)],
    });
    if action == "screenshot" {
        let name = step["options"]["name"].as_str().unwrap_or("shot");
        result["screenshot_path"] = json!(format!("/tmp/mock-agent/{}.png", name));
    }
    result
}

/// Serve the protocol on this process's stdio until stdin closes.
///
/// Returns the exit code the process should end with.
pub async fn run(options: AgentOptions) -> std::io::Result<i32> {
    let mut agent = MockAgent::new(options);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    for line in agent.stderr_greeting() {
        stderr.write_all(format!("{}\n", line).as_bytes()).await?;
    }
    for line in agent.stdout_greeting() {
        stdout.write_all(format!("{}\n", line).as_bytes()).await?;
    }
    stdout.flush().await?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = input.next_line().await? {
        match agent.handle(&line) {
            Response::Exit(code) => return Ok(code),
            Response::Lines(lines) if lines.is_empty() => {}
            Response::Lines(lines) => {
                if !agent.delay().is_zero() {
                    tokio::time::sleep(agent.delay()).await;
                }
                for line in lines {
                    stdout.write_all(format!("{}\n", line).as_bytes()).await?;
                }
                stdout.flush().await?;
            }
        }
    }

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: &str, steps: &[(u32, &str, Value)]) -> String {
        let steps: Vec<Value> = steps
            .iter()
            .map(|(n, action, options)| {
                json!({"step_number": n, "action": action, "options": options, "description": format!("step {}", n)})
            })
            .collect();
        json!({
            "command_id": id,
            "command": "execute_step",
            "payload": {
                "test_name": "Login",
                "test_module": "Auth",
                "steps": steps,
                "expected_results_description": "dashboard",
                "options": {"capture_screenshots_for_steps": true, "validate_results_against_description": true},
            },
        })
        .to_string()
    }

    fn single_line(response: Response) -> Value {
        match response {
            Response::Lines(lines) => {
                assert_eq!(lines.len(), 1);
                serde_json::from_str(&lines[0]).unwrap()
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_replies_echo_command_id() {
        let mut agent = MockAgent::new(AgentOptions::default());
        let reply = single_line(agent.handle(&command(
            "cmd_7",
            &[(1, "navigate", json!({"url": "https://example.com"}))],
        )));
        assert_eq!(reply["command_id"], "cmd_7");
        assert_eq!(reply["payload"]["step_results"][0]["step_number"], 1);
        assert_eq!(reply["payload"]["step_results"][0]["status"], "success");
        assert!(reply["payload"].get("validation_outcome").is_none());
    }

    #[test]
    fn test_final_screenshot_gets_path_and_verdict() {
        let mut agent = MockAgent::new(AgentOptions {
            validate: true,
            ..Default::default()
        });
        let reply = single_line(agent.handle(&command(
            "cmd_1",
            &[(4, "screenshot", json!({"name": "final", "capture_screenshot": true}))],
        )));
        let step = &reply["payload"]["step_results"][0];
        assert_eq!(step["screenshot_path"], "/tmp/mock-agent/final.png");
        assert_eq!(reply["payload"]["validation_outcome"]["passed"], true);
    }

    #[test]
    fn test_scripted_failures() {
        let mut agent = MockAgent::new(AgentOptions {
            fail_step: Some(2),
            hang_step: Some(3),
            crash_on: Some(4),
            ..Default::default()
        });
        let ok = single_line(agent.handle(&command("cmd_1", &[(1, "click", json!({}))])));
        assert!(ok.get("payload").is_some());

        let failed = single_line(agent.handle(&command("cmd_2", &[(2, "click", json!({}))])));
        assert_eq!(failed["error"]["message"], "mock failure at step 2");

        assert_eq!(
            agent.handle(&command("cmd_3", &[(3, "click", json!({}))])),
            Response::Lines(vec![])
        );
        assert_eq!(
            agent.handle(&command("cmd_4", &[(4, "click", json!({}))])),
            Response::Exit(3)
        );
    }

    #[test]
    fn test_noise_precedes_reply() {
        let mut agent = MockAgent::new(AgentOptions {
            noisy: true,
            ..Default::default()
        });
        match agent.handle(&command("cmd_1", &[(1, "wait", json!({"duration_ms": 10}))])) {
            Response::Lines(lines) => {
                assert_eq!(lines.len(), 4);
                assert!(serde_json::from_str::<Value>(&lines[0]).is_err());
                assert!(lines[3].contains("\"cmd_1\""));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lists_tools() {
        let mut agent = MockAgent::new(AgentOptions::default());
        let line = json!({"command_id": "cmd_3", "command": "list_tools", "payload": {}}).to_string();
        let reply = single_line(agent.handle(&line));
        assert_eq!(reply["command_id"], "cmd_3");
        assert_eq!(reply["payload"]["tools"][0]["name"], "browser_navigate");
        assert_eq!(reply["payload"]["tools"].as_array().unwrap().len(), MOCK_TOOLS.len());
    }

    #[test]
    fn test_greetings_follow_mode() {
        let ready = MockAgent::new(AgentOptions::default());
        assert_eq!(ready.stdout_greeting(), vec![r#"{"event":"mcp_ready"}"#.to_string()]);

        let banner = MockAgent::new(AgentOptions {
            mode: AgentMode::Banner,
            ..Default::default()
        });
        assert!(banner.stdout_greeting().is_empty());
        assert!(banner.stderr_greeting()[0].contains("Playwright MCP ready"));
    }
}
