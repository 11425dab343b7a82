use std::path::PathBuf;

use async_trait::async_trait;

use crate::{permissions::PermissionEngine, Result};

use super::types::*;

/// History turns rendered into the backend prompt.
pub const PROMPT_HISTORY_TURNS: usize = 5;

/// One unit of work handed to a backend.
#[derive(Clone, Debug)]
pub struct BackendRequest {
    pub prompt: String,
    pub options: QueryOptions,
    pub context: Option<QueryContext>,
    /// Gate every tool call must pass before it executes.
    pub gate: PermissionEngine,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>, options: QueryOptions) -> Self {
        let gate = PermissionEngine::for_request(&options);
        Self {
            prompt: prompt.into(),
            options,
            context: None,
            gate,
        }
    }

    pub fn with_context(mut self, context: Option<QueryContext>) -> Self {
        self.context = context;
        self
    }

    /// The prompt with the most recent history turns prepended as `role: content` lines.
    pub fn render_prompt(&self) -> String {
        let history = match &self.context {
            Some(ctx) if !ctx.history.is_empty() => &ctx.history,
            _ => return self.prompt.clone(),
        };

        let start = history.len().saturating_sub(PROMPT_HISTORY_TURNS);
        let lines = history[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Conversation history:\n{lines}\n\nCurrent question: {}",
            self.prompt
        )
    }
}

/// The AI collaborator behind the worker.
///
/// Callback-based like the model clients it wraps: the backend drives its own loop and
/// hands each message to `on_message` in order. An error from `on_message` stops the run.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        req: BackendRequest,
        on_message: &mut (dyn FnMut(ConversationMessage) -> Result<()> + Send),
    ) -> Result<()>;
}

/// Replies with a single assistant message echoing the rendered prompt.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoBackend;

#[async_trait]
impl Backend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(
        &self,
        req: BackendRequest,
        on_message: &mut (dyn FnMut(ConversationMessage) -> Result<()> + Send),
    ) -> Result<()> {
        on_message(ConversationMessage::assistant(format!(
            "echo: {}",
            req.render_prompt()
        )))
    }
}

// ============== Claude CLI invocation ==============

#[derive(Clone, Debug)]
pub struct ClaudeCliConfig {
    pub claude_path: PathBuf,
    /// Used when the request does not name a model.
    pub model: Option<String>,
    pub working_dir: PathBuf,
}

/// A concrete CLI invocation.
#[derive(Clone, Debug)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Turns a [`BackendRequest`] into `claude` CLI flags.
#[derive(Clone, Debug)]
pub struct ClaudeCliPromptAdapter {
    pub cfg: ClaudeCliConfig,
}

impl ClaudeCliPromptAdapter {
    pub fn build_invocation(&self, req: &BackendRequest) -> CliInvocation {
        let mut args: Vec<String> = vec![
            // Non-interactive streaming NDJSON.
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            req.options.max_turns_or_default().to_string(),
        ];

        let (allow, deny) = req.gate.cli_rules();
        if !allow.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(allow.join(","));
        }
        if !deny.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(deny.join(","));
        }

        if let Some(sys) = &req.options.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(sys.clone());
        }

        if let Some(model) = req.options.model.as_ref().or(self.cfg.model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        // Prompt as the final positional argument.
        args.push(req.render_prompt());

        CliInvocation {
            program: self.cfg.claude_path.clone(),
            args,
            cwd: self.cfg.working_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolName;

    fn history(n: usize) -> QueryContext {
        QueryContext {
            history: (0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        ConversationMessage::user(format!("q{i}"))
                    } else {
                        ConversationMessage::assistant(format!("a{i}"))
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn prompt_without_history_is_unchanged() {
        let req = BackendRequest::new("hello", QueryOptions::default());
        assert_eq!(req.render_prompt(), "hello");
        let req = req.with_context(Some(QueryContext::default()));
        assert_eq!(req.render_prompt(), "hello");
    }

    #[test]
    fn prompt_keeps_only_the_last_five_turns() {
        let req = BackendRequest::new("next?", QueryOptions::default())
            .with_context(Some(history(7)));
        let prompt = req.render_prompt();
        assert!(!prompt.contains("q0"));
        assert!(!prompt.contains("a1"));
        assert!(prompt.contains("user: q2\nassistant: a3"));
        assert!(prompt.ends_with("a5\nuser: q6\n\nCurrent question: next?"));
    }

    #[tokio::test]
    async fn echo_backend_replies_once() {
        let mut seen = Vec::new();
        let mut sink = |m: ConversationMessage| -> Result<()> {
            seen.push(m);
            Ok(())
        };
        EchoBackend
            .run(BackendRequest::new("ping", QueryOptions::default()), &mut sink)
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].role, Role::Assistant);
        assert_eq!(seen[0].content, "echo: ping");
    }

    fn adapter() -> ClaudeCliPromptAdapter {
        ClaudeCliPromptAdapter {
            cfg: ClaudeCliConfig {
                claude_path: PathBuf::from("/usr/local/bin/claude"),
                model: Some("default-model".into()),
                working_dir: PathBuf::from("/work"),
            },
        }
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn invocation_carries_turns_tools_and_prompt() {
        let options = QueryOptions {
            max_turns: Some(2),
            allowed_tools: Some(vec![ToolName::Read, ToolName::Grep]),
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let inv = adapter().build_invocation(&BackendRequest::new("find todos", options));

        assert_eq!(inv.args[0], "-p");
        assert_eq!(flag(&inv.args, "--output-format"), Some("stream-json"));
        assert_eq!(flag(&inv.args, "--max-turns"), Some("2"));
        assert_eq!(flag(&inv.args, "--allowedTools"), Some("Grep,Read"));
        let deny = flag(&inv.args, "--disallowedTools").unwrap();
        assert!(deny.contains("Bash") && deny.contains("Bash(rm:*)"));
        assert_eq!(flag(&inv.args, "--append-system-prompt"), Some("be brief"));
        assert_eq!(flag(&inv.args, "--model"), Some("default-model"));
        assert_eq!(inv.args.last().map(String::as_str), Some("find todos"));
        assert_eq!(inv.cwd, PathBuf::from("/work"));
    }

    #[test]
    fn request_model_overrides_configured_model() {
        let options = QueryOptions {
            model: Some("override".into()),
            ..Default::default()
        };
        let inv = adapter().build_invocation(&BackendRequest::new("x", options));
        assert_eq!(flag(&inv.args, "--model"), Some("override"));
        assert_eq!(flag(&inv.args, "--max-turns"), Some("3"));
    }
}
