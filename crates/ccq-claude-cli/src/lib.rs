//! Claude CLI backend.
//!
//! Each run spawns `claude -p --output-format stream-json` and turns its NDJSON events
//! into conversation messages. Every tool call the CLI reports passes the request's
//! permission gate before it is forwarded; a denied call stops the run.
//!
//! The CLI reports a `tool_use` block when it issues the call, and in `-p` mode it may run
//! the tool before the kill lands. Enforcement before execution therefore rests on the
//! `--allowedTools`/`--disallowedTools` flags built from the same gate
//! ([`PermissionEngine::cli_rules`]); the stream check is a second line that stops the run
//! and reports `PermissionDenied`.

use std::{collections::VecDeque, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use ccq_core::{
    errors::Error,
    model::{
        client::{Backend, BackendRequest, ClaudeCliConfig, ClaudeCliPromptAdapter},
        types::{ConversationMessage, ToolCall},
    },
    permissions::PermissionEngine,
    tools::ToolName,
    transport::read_frame_line,
    utils::{json_preview, truncate_text},
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the joining newline.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// One decoded stream-json line.
#[derive(Clone, Debug, PartialEq)]
pub enum CliEvent {
    /// Assistant output, already cleared by the gate.
    Message(ConversationMessage),
    /// The closing `result` event.
    Finished { is_error: bool, text: String },
    /// System, user (tool result) and unrecognised events.
    Ignored,
}

/// Decode one line of CLI output, checking any tool calls it carries against `gate`.
pub fn parse_line(line: &str, gate: &PermissionEngine) -> Result<CliEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(CliEvent::Ignored);
    }
    let value: Value = serde_json::from_str(line).map_err(|e| {
        Error::QueryFailed(format!(
            "claude stream-json parse failed: {e}\nstdout line: {}",
            truncate_text(line, 500)
        ))
    })?;

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => parse_assistant(&value, gate),
        Some("result") => Ok(CliEvent::Finished {
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            text: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        _ => Ok(CliEvent::Ignored),
    }
}

fn parse_assistant(value: &Value, gate: &PermissionEngine) -> Result<CliEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Ok(CliEvent::Ignored);
    };

    let mut text = Vec::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push(t);
                }
            }
            Some("tool_use") => calls.push(gated_tool_call(block, gate)?),
            _ => {}
        }
    }

    if text.is_empty() && calls.is_empty() {
        return Ok(CliEvent::Ignored);
    }
    Ok(CliEvent::Message(
        ConversationMessage::assistant(text.join("\n")).with_tool_calls(calls),
    ))
}

fn gated_tool_call(block: &Value, gate: &PermissionEngine) -> Result<ToolCall> {
    let name = block
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let tool: ToolName = name.parse().map_err(|_| Error::PermissionDenied {
        tool: name.to_string(),
        reason: "not a recognised tool".to_string(),
    })?;
    let arguments = match block.get("input") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    gate.check(tool, tool_argument(tool, &arguments))?;
    debug!(
        %tool,
        input = %json_preview(&serde_json::Value::Object(arguments.clone()), 200),
        "tool call cleared"
    );

    Ok(ToolCall {
        id: block
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tool,
        arguments,
        result: None,
    })
}

/// The input field permission patterns are matched against, e.g. `Bash(<command>)`.
fn tool_argument(tool: ToolName, input: &Map<String, Value>) -> Option<&str> {
    let key = match tool {
        ToolName::Bash => "command",
        ToolName::Read | ToolName::Write | ToolName::Edit | ToolName::MultiEdit => "file_path",
        ToolName::NotebookRead | ToolName::NotebookEdit => "notebook_path",
        ToolName::Grep | ToolName::Glob => "pattern",
        ToolName::Ls => "path",
        ToolName::WebFetch => "url",
        ToolName::WebSearch => "query",
        ToolName::Task | ToolName::TodoWrite => return None,
    };
    input.get(key).and_then(Value::as_str)
}

#[derive(Clone, Debug)]
pub struct ClaudeCliBackend {
    cfg: ClaudeCliConfig,
}

impl ClaudeCliBackend {
    pub fn new(cfg: ClaudeCliConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ClaudeCliConfig {
        &self.cfg
    }
}

#[async_trait]
impl Backend for ClaudeCliBackend {
    fn name(&self) -> &'static str {
        "claude-cli"
    }

    async fn run(
        &self,
        req: BackendRequest,
        on_message: &mut (dyn FnMut(ConversationMessage) -> Result<()> + Send),
    ) -> Result<()> {
        let adapter = ClaudeCliPromptAdapter {
            cfg: self.cfg.clone(),
        };
        let inv = adapter.build_invocation(&req);

        // Dropping the run (worker shutdown) kills the process.
        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .current_dir(&inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::QueryFailed(format!(
                    "failed to start {}: {e}",
                    inv.program.display()
                ))
            })?;
        debug!(pid = ?child.id(), cwd = %inv.cwd.display(), "claude started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("claude stdout was not captured".to_string()))?;
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr so a full pipe never blocks the process.
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr);
                let mut buf = Vec::new();
                while matches!(r.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tail.lock().await.push_line(line);
                    buf.clear();
                }
            })
        });

        let mut finished: Option<(bool, String)> = None;
        let mut emitted = 0usize;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        while let Some(line) = read_frame_line(&mut reader, &mut buf).await? {
            let event = match parse_line(&line, &req.gate) {
                Ok(ev) => ev,
                Err(e) => {
                    if let Error::PermissionDenied { tool, reason } = &e {
                        warn!(%tool, %reason, "blocked tool call, stopping claude");
                    }
                    return Err(with_kill_failure(e, kill_child(&mut child).await));
                }
            };

            match event {
                CliEvent::Message(m) => {
                    emitted += 1;
                    if let Err(e) = on_message(m) {
                        return Err(with_kill_failure(e, kill_child(&mut child).await));
                    }
                }
                CliEvent::Finished { is_error, text } => finished = Some((is_error, text)),
                CliEvent::Ignored => {}
            }
        }

        let status = child.wait().await?;
        info!(%status, messages = emitted, "claude finished");

        match finished {
            Some((true, text)) => Err(Error::QueryFailed(if text.is_empty() {
                "claude reported an error".to_string()
            } else {
                text
            })),
            Some((false, _)) => Ok(()),
            None if status.success() => Ok(()),
            None => {
                if let Some(task) = stderr_task {
                    // A grandchild may still hold the pipe open.
                    let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, task).await;
                }
                let stderr = stderr_tail.lock().await.snapshot();
                if stderr.trim().is_empty() {
                    return Err(Error::QueryFailed(format!(
                        "claude exited with status {status}"
                    )));
                }
                Err(Error::QueryFailed(format!(
                    "claude exited with status {status}\nstderr (tail):\n{stderr}"
                )))
            }
        }
    }
}

fn with_kill_failure(err: Error, kill: Result<()>) -> Error {
    match kill {
        Ok(()) => err,
        Err(kill_e) => Error::External(format!(
            "{err} (also failed to kill claude process: {kill_e})"
        )),
    }
}

async fn kill_child(child: &mut Child) -> Result<()> {
    // Already exited: `try_wait` reaps it.
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    match child.kill().await {
        Ok(()) => Ok(()),
        // It may have exited between `try_wait` and `kill`.
        Err(e) if child.try_wait()?.is_none() => Err(Error::Io(e)),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccq_core::model::types::{QueryOptions, Role};
    use serde_json::json;

    fn line(v: Value) -> String {
        v.to_string()
    }

    fn assistant(blocks: Value) -> String {
        line(json!({"type": "assistant", "message": {"role": "assistant", "content": blocks}}))
    }

    fn gate() -> PermissionEngine {
        PermissionEngine::default()
    }

    #[test]
    fn text_blocks_become_one_assistant_message() {
        let ev = parse_line(
            &assistant(json!([
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ])),
            &gate(),
        )
        .unwrap();
        let CliEvent::Message(m) = ev else {
            panic!("expected a message, got {ev:?}");
        };
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.content, "first\nsecond");
        assert!(m.tool_calls.is_none());
    }

    #[test]
    fn allowed_tool_calls_are_forwarded_with_their_input() {
        let ev = parse_line(
            &assistant(json!([
                {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"file_path": "src/main.rs"}}
            ])),
            &gate(),
        )
        .unwrap();
        let CliEvent::Message(m) = ev else {
            panic!("expected a message, got {ev:?}");
        };
        let calls = m.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[0].tool, ToolName::Read);
        assert_eq!(calls[0].arguments["file_path"], "src/main.rs");
    }

    #[test]
    fn disabled_and_unknown_tools_are_denied() {
        let err = parse_line(
            &assistant(json!([{"type": "tool_use", "id": "t", "name": "Bash", "input": {"command": "ls"}}])),
            &gate(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { ref tool, .. } if tool == "Bash"));

        let err = parse_line(
            &assistant(json!([{"type": "tool_use", "id": "t", "name": "mcp__db__query", "input": {}}])),
            &gate(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { ref tool, .. } if tool == "mcp__db__query"));
    }

    #[test]
    fn deny_rules_apply_to_the_command_argument() {
        let options = QueryOptions {
            allowed_tools: Some(vec![ToolName::Bash]),
            ..Default::default()
        };
        let gate = PermissionEngine::for_request(&options);
        let call = |cmd: &str| {
            assistant(json!([{"type": "tool_use", "id": "t", "name": "Bash", "input": {"command": cmd}}]))
        };

        assert!(matches!(
            parse_line(&call("git status"), &gate),
            Ok(CliEvent::Message(_))
        ));
        assert!(matches!(
            parse_line(&call("rm -rf /"), &gate),
            Err(Error::PermissionDenied { .. })
        ));
    }

    #[test]
    fn result_events_finish_the_run() {
        let ev = parse_line(
            &line(json!({"type": "result", "subtype": "success", "is_error": false, "result": "done"})),
            &gate(),
        )
        .unwrap();
        assert_eq!(
            ev,
            CliEvent::Finished {
                is_error: false,
                text: "done".into()
            }
        );
    }

    #[test]
    fn other_events_and_blank_lines_are_ignored() {
        for l in [
            String::new(),
            line(json!({"type": "system", "subtype": "init", "session_id": "abc"})),
            line(json!({"type": "user", "message": {"content": [{"type": "tool_result", "content": "ok"}]}})),
            assistant(json!([{"type": "thinking", "thinking": "hmm"}])),
        ] {
            assert_eq!(parse_line(&l, &gate()).unwrap(), CliEvent::Ignored, "{l}");
        }
    }

    #[test]
    fn malformed_lines_fail_the_query() {
        assert!(matches!(
            parse_line("{not json", &gate()),
            Err(Error::QueryFailed(_))
        ));
    }

    #[test]
    fn stderr_tail_keeps_the_most_recent_lines() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_MAX_LINES + 10) {
            tail.push_line(format!("line {i}"));
        }
        let snap = tail.snapshot();
        assert!(!snap.contains("line 9\n"));
        assert!(snap.ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 9)));
        assert_eq!(tail.lines.len(), STDERR_TAIL_MAX_LINES);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_a_cli_process_end_to_end() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let backend = |path| {
            ClaudeCliBackend::new(ClaudeCliConfig {
                claude_path: path,
                model: None,
                working_dir: dir.path().to_path_buf(),
            })
        };
        let request = || BackendRequest::new("hello", QueryOptions::default());

        let ok = script(
            "ok",
            &format!(
                "cat <<'EOF'\n{}\n{}\nEOF",
                assistant(json!([{"type": "text", "text": "hi there"}])),
                line(json!({"type": "result", "is_error": false, "result": "hi there"}))
            ),
        );
        let mut seen = Vec::new();
        let mut sink = |m: ConversationMessage| -> Result<()> {
            seen.push(m.content);
            Ok(())
        };
        backend(ok).run(request(), &mut sink).await.unwrap();
        assert_eq!(seen, vec!["hi there"]);

        let errored = script(
            "errored",
            &format!(
                "cat <<'EOF'\n{}\nEOF",
                line(json!({"type": "result", "is_error": true, "result": "max turns reached"}))
            ),
        );
        let mut sink = |_: ConversationMessage| -> Result<()> { Ok(()) };
        let err = backend(errored).run(request(), &mut sink).await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(ref m) if m == "max turns reached"));

        let crashed = script("crashed", "echo 'login required' >&2\nexit 3");
        let err = backend(crashed).run(request(), &mut sink).await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(ref m) if m.contains("login required")));

        let denied = script(
            "denied",
            &format!(
                "cat <<'EOF'\n{}\nEOF\nsleep 5",
                assistant(json!([{"type": "tool_use", "id": "t", "name": "Write", "input": {"file_path": "x"}}]))
            ),
        );
        let err = backend(denied).run(request(), &mut sink).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { ref tool, .. } if tool == "Write"));
    }
}
