use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use agent_fleet_error::FleetError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{AgentEvent, AgentRequest, AgentRuntime, AgentStream, BoxAgentStream};

const STDERR_TAIL_LINES: usize = 50;

/// Runs each query as a Claude Code CLI process in `stream-json` mode.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: PathBuf,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(request.max_turns.to_string());
        if let Some(system_prompt) = request.system_prompt.as_deref() {
            command.arg("--system-prompt").arg(system_prompt);
        }
        if let Some(model) = request.model.as_deref() {
            command.arg("--model").arg(model);
        }
        if let Some(mcp) = request.mcp_config.as_ref().filter(|mcp| !mcp.is_empty()) {
            command
                .arg("--mcp-config")
                .arg(json!({ "mcpServers": mcp.servers }).to_string());
        }
        command
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn open(&self, request: AgentRequest) -> Result<BoxAgentStream, FleetError> {
        let mut child = self.command(&request).spawn().map_err(|err| {
            FleetError::agent_fault(format!(
                "failed to start agent process {}: {err}",
                self.program.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::agent_fault("failed to capture agent process stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FleetError::agent_fault("failed to capture agent process stderr"))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let capture = stderr_tail.clone();
        let instance_id = request.instance_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(instance_id = %instance_id, "agent process stderr: {}", line);
                let mut tail = capture.lock().await;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        tracing::debug!(
            instance_id = %request.instance_id,
            pid = ?child.id(),
            cwd = %request.working_dir.display(),
            "agent process started"
        );

        Ok(Box::new(ProcessStream {
            child,
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            stderr_tail,
            saw_result: false,
            finished: false,
        }))
    }
}

struct ProcessStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<AgentEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    saw_result: bool,
    finished: bool,
}

impl ProcessStream {
    async fn stderr_text(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }

    /// Called once stdout reached EOF.
    async fn finish(&mut self) -> Option<Result<AgentEvent, FleetError>> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => {
                return Some(Err(FleetError::agent_fault(format!(
                    "failed waiting for agent process: {err}"
                ))))
            }
        };
        if self.saw_result {
            return None;
        }
        Some(Err(FleetError::AgentFault {
            message: if status.success() {
                "agent process ended without a result".to_string()
            } else {
                format!("agent process exited unexpectedly ({status})")
            },
            exit_code: status.code(),
            stderr: self.stderr_text().await,
        }))
    }
}

#[async_trait]
impl AgentStream for ProcessStream {
    async fn next_event(&mut self) -> Option<Result<AgentEvent, FleetError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value = match serde_json::from_str::<Value>(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::debug!(error = %err, "skipping unparsed agent output: {}", line);
                            continue;
                        }
                    };
                    match parse_stream_line(&value) {
                        Ok(events) => {
                            if events
                                .iter()
                                .any(|event| matches!(event, AgentEvent::Result { .. }))
                            {
                                self.saw_result = true;
                            }
                            self.pending.extend(events);
                        }
                        Err(fault) => {
                            self.finished = true;
                            return Some(Err(fault));
                        }
                    }
                }
                Ok(None) => {
                    self.finished = true;
                    return self.finish().await;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(FleetError::agent_fault(format!(
                        "failed reading agent output: {err}"
                    ))));
                }
            }
        }
    }

    async fn cancel(&mut self) {
        self.finished = true;
        self.pending.clear();
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "agent process already gone");
        }
    }
}

/// Maps one `stream-json` line to zero or more events. A result line that
/// reports an error becomes a fault.
fn parse_stream_line(value: &Value) -> Result<Vec<AgentEvent>, FleetError> {
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(blocks
                .iter()
                .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .map(AgentEvent::text),
                    Some("tool_use") => Some(AgentEvent::ToolUse {
                        id: string_field(block, "id"),
                        name: string_field(block, "name"),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => None,
                })
                .collect())
        }
        Some("result") => {
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .is_some_and(|subtype| subtype.starts_with("error"));
            let summary = value
                .get("result")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            if is_error {
                return Err(FleetError::agent_fault(
                    summary.unwrap_or_else(|| "agent reported an error result".to_string()),
                ));
            }
            let usage = value.get("usage");
            let tokens = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64);
            let total_tokens = match (tokens("input_tokens"), tokens("output_tokens")) {
                (None, None) => None,
                (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
            };
            Ok(vec![AgentEvent::Result {
                summary,
                total_tokens,
                cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            }])
        }
        _ => Ok(Vec::new()),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_line_yields_text_and_tool_events() {
        let line = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "Looking"},
                    {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
                ]
            }
        });
        let events = parse_stream_line(&line).unwrap();
        assert_eq!(
            events,
            vec![
                AgentEvent::text("Looking"),
                AgentEvent::ToolUse {
                    id: "t1".to_string(),
                    name: "Bash".to_string(),
                    input: json!({"command": "ls"}),
                },
            ]
        );
    }

    #[test]
    fn result_line_sums_usage() {
        let line = json!({
            "type": "result",
            "subtype": "success",
            "result": "done",
            "total_cost_usd": 0.25,
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        assert_eq!(
            parse_stream_line(&line).unwrap(),
            vec![AgentEvent::Result {
                summary: Some("done".to_string()),
                total_tokens: Some(15),
                cost_usd: Some(0.25),
            }]
        );
    }

    #[test]
    fn error_result_is_a_fault() {
        let line = json!({"type": "result", "subtype": "error_max_turns", "is_error": true});
        assert!(matches!(
            parse_stream_line(&line),
            Err(FleetError::AgentFault { .. })
        ));
    }

    #[test]
    fn system_lines_are_ignored() {
        let line = json!({"type": "system", "subtype": "init"});
        assert!(parse_stream_line(&line).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_an_agent_fault() {
        let runtime = ProcessRuntime::new("/nonexistent/agent-fleet-test-binary");
        let request = AgentRequest {
            instance_id: "a".to_string(),
            prompt: "hi".to_string(),
            working_dir: std::env::temp_dir(),
            env: Default::default(),
            mcp_config: None,
            max_turns: 1,
            system_prompt: None,
            model: None,
        };
        match runtime.open(request).await {
            Err(FleetError::AgentFault { message, .. }) => {
                assert!(message.contains("failed to start agent process"))
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
