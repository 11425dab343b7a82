//! Rule-based capability gate.
//!
//! Evaluation order for `evaluate(tool, arg)`:
//! 1. the tool's base `allowed` flag is the outer gate; rules can never re-enable a
//!    disabled tool
//! 2. without an argument an enabled tool is allowed
//! 3. with an argument, `Tool(arg)` is matched against the deny rules, then the allow
//!    rules, first match wins
//! 4. no match falls back to the base flag

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::Path,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    errors::Error,
    model::types::QueryOptions,
    presets::ScenarioPreset,
    tools::ToolName,
    Result,
};

// ============== Patterns ==============

/// A glob-style rule: `*` matches any run of characters, everything else is literal,
/// and the whole invocation string must match.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^(?s:{body})$"))
            .map_err(|e| Error::Config(format!("invalid permission pattern {source:?}: {e}")))?;
        Ok(Self { source, regex })
    }

    pub fn matches(&self, invocation: &str) -> bool {
        self.regex.is_match(invocation)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Pattern {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Pattern::new(s)
    }
}

impl From<Pattern> for String {
    fn from(p: Pattern) -> Self {
        p.source
    }
}

/// Ordered allow/deny rule lists shared by every tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRules {
    #[serde(default)]
    pub allow: Vec<Pattern>,
    #[serde(default)]
    pub deny: Vec<Pattern>,
}

impl GlobalRules {
    pub fn new(allow: &[&str], deny: &[&str]) -> Result<Self> {
        Ok(Self {
            allow: compile_all(allow)?,
            deny: compile_all(deny)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn compile_all(patterns: &[&str]) -> Result<Vec<Pattern>> {
    patterns.iter().map(|p| Pattern::new(*p)).collect()
}

// ============== Tool permissions ==============

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    pub tool: ToolName,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolPermission {
    fn new(tool: ToolName, allowed: bool, description: &str) -> Self {
        Self {
            tool,
            allowed,
            restrictions: None,
            description: Some(description.to_string()),
        }
    }
}

fn default_tool_permissions() -> Vec<ToolPermission> {
    vec![
        ToolPermission::new(ToolName::Read, true, "Read file contents"),
        ToolPermission::new(ToolName::Grep, true, "Search file contents"),
        ToolPermission::new(ToolName::Glob, true, "Match file patterns"),
        ToolPermission::new(ToolName::TodoWrite, true, "Manage task lists"),
        ToolPermission::new(ToolName::Task, true, "Run complex sub-tasks"),
        ToolPermission::new(ToolName::WebSearch, true, "Search the web"),
        ToolPermission::new(
            ToolName::WebFetch,
            false,
            "Fetch web pages (requires extra permission)",
        ),
        ToolPermission::new(
            ToolName::Bash,
            false,
            "Execute shell commands (requires extra permission)",
        ),
        ToolPermission::new(
            ToolName::Write,
            false,
            "Write files (requires extra permission)",
        ),
        ToolPermission::new(
            ToolName::Edit,
            false,
            "Edit files (requires extra permission)",
        ),
    ]
}

const DEFAULT_DENY_RULES: [&str; 5] = [
    "Bash(rm*)",
    "Bash(sudo*)",
    "Bash(chmod 777*)",
    "Bash(* | sh)",
    "Bash(* | bash)",
];

// ============== Engine ==============

/// Outcome of one evaluation, with a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Plain, serializable form of the engine state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub permissions: Vec<ToolPermission>,
    pub rules: GlobalRules,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSummary {
    pub allowed_tools: usize,
    pub denied_tools: usize,
    pub allow_rules: usize,
    pub deny_rules: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionEngine {
    permissions: BTreeMap<ToolName, ToolPermission>,
    rules: GlobalRules,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        let permissions = default_tool_permissions()
            .into_iter()
            .map(|p| (p.tool, p))
            .collect();
        let deny = DEFAULT_DENY_RULES
            .iter()
            .filter_map(|p| Pattern::new(*p).ok())
            .collect();
        Self {
            permissions,
            rules: GlobalRules {
                allow: Vec::new(),
                deny,
            },
        }
    }
}

impl PermissionEngine {
    /// No tool entries and no rules: everything is denied.
    pub fn empty() -> Self {
        Self {
            permissions: BTreeMap::new(),
            rules: GlobalRules::default(),
        }
    }

    /// Gate for a single request: the default engine narrowed to the tools and rules the
    /// request options name.
    pub fn for_request(options: &QueryOptions) -> Self {
        let mut engine = Self::default();
        if let Some(tools) = &options.allowed_tools {
            for tool in ToolName::ALL {
                engine.set_tool_permission(tool, tools.contains(&tool), None);
            }
        }
        if let Some(rules) = &options.permissions {
            engine.rules = rules.clone();
        }
        engine
    }

    pub fn evaluate(&self, tool: ToolName, arg: Option<&str>) -> Decision {
        let Some(perm) = self.permissions.get(&tool) else {
            return Decision::deny(format!("tool {tool} has no permission entry"));
        };
        if !perm.allowed {
            return Decision::deny(format!("tool {tool} is disabled"));
        }
        let Some(arg) = arg else {
            return Decision::allow(format!("tool {tool} is enabled"));
        };

        let invocation = format!("{tool}({arg})");
        if let Some(rule) = self.rules.deny.iter().find(|p| p.matches(&invocation)) {
            return Decision::deny(format!("{invocation} matches deny rule {rule}"));
        }
        if let Some(rule) = self.rules.allow.iter().find(|p| p.matches(&invocation)) {
            return Decision::allow(format!("{invocation} matches allow rule {rule}"));
        }
        Decision::allow(format!("tool {tool} is enabled"))
    }

    pub fn is_allowed(&self, tool: ToolName, arg: Option<&str>) -> bool {
        self.evaluate(tool, arg).allowed
    }

    /// Like [`Self::evaluate`], but a denial becomes `Error::PermissionDenied`.
    pub fn check(&self, tool: ToolName, arg: Option<&str>) -> Result<()> {
        let decision = self.evaluate(tool, arg);
        if decision.allowed {
            return Ok(());
        }
        Err(Error::PermissionDenied {
            tool: tool.to_string(),
            reason: decision.reason,
        })
    }

    /// Evaluate the textual form `Tool(arg)` (or a bare `Tool`).
    pub fn validate_invocation(&self, text: &str) -> Decision {
        let text = text.trim();
        let (name, arg) = match text.split_once('(') {
            Some((name, rest)) => match rest.strip_suffix(')') {
                Some(arg) => (name, Some(arg)),
                None => return Decision::deny(format!("malformed invocation: {text}")),
            },
            None => (text, None),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Decision::deny(format!("malformed invocation: {text}"));
        }
        match name.parse::<ToolName>() {
            Ok(tool) => self.evaluate(tool, arg),
            Err(_) => Decision::deny(format!("unknown tool: {name}")),
        }
    }

    // ============== Mutation ==============

    pub fn set_tool_permission(
        &mut self,
        tool: ToolName,
        allowed: bool,
        restrictions: Option<Vec<String>>,
    ) {
        let entry = self.permissions.entry(tool).or_insert_with(|| ToolPermission {
            tool,
            allowed,
            restrictions: None,
            description: None,
        });
        entry.allowed = allowed;
        if restrictions.is_some() {
            entry.restrictions = restrictions;
        }
    }

    pub fn add_allow_rule(&mut self, pattern: &str) -> Result<()> {
        push_unique(&mut self.rules.allow, Pattern::new(pattern)?);
        Ok(())
    }

    pub fn add_deny_rule(&mut self, pattern: &str) -> Result<()> {
        push_unique(&mut self.rules.deny, Pattern::new(pattern)?);
        Ok(())
    }

    pub fn remove_allow_rule(&mut self, pattern: &str) {
        self.rules.allow.retain(|p| p.as_str() != pattern);
    }

    pub fn remove_deny_rule(&mut self, pattern: &str) {
        self.rules.deny.retain(|p| p.as_str() != pattern);
    }

    pub fn set_rules(&mut self, rules: GlobalRules) {
        self.rules = rules;
    }

    /// Enable the preset's allowed tools, disable its denied tools, leave every other
    /// tool untouched, and replace the global rules wholesale.
    pub fn apply_preset(&mut self, preset: &ScenarioPreset) {
        for tool in &preset.allowed_tools {
            self.set_tool_permission(*tool, true, None);
        }
        for tool in &preset.denied_tools {
            self.set_tool_permission(*tool, false, None);
        }
        self.rules = preset.rules.clone();
    }

    // ============== Queries ==============

    pub fn rules(&self) -> &GlobalRules {
        &self.rules
    }

    /// Rules for one request: this engine's rules plus any extra deny rules the request
    /// asks for. Requested allow rules are dropped, so a request can only narrow.
    pub fn narrowed_rules(&self, requested: Option<&GlobalRules>) -> GlobalRules {
        let mut rules = self.rules.clone();
        if let Some(requested) = requested {
            for pattern in &requested.deny {
                push_unique(&mut rules.deny, pattern.clone());
            }
        }
        rules
    }

    pub fn permission(&self, tool: ToolName) -> Option<&ToolPermission> {
        self.permissions.get(&tool)
    }

    pub fn allowed_tools(&self) -> Vec<ToolName> {
        self.permissions
            .values()
            .filter(|p| p.allowed)
            .map(|p| p.tool)
            .collect()
    }

    pub fn description(&self, tool: ToolName) -> Option<&str> {
        self.permissions
            .get(&tool)
            .and_then(|p| p.description.as_deref())
    }

    /// Command parts of allow rules written as `Tool(...)`.
    pub fn allowed_commands(&self, tool: ToolName) -> Vec<String> {
        let prefix = format!("{tool}(");
        self.rules
            .allow
            .iter()
            .filter_map(|p| {
                p.as_str()
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(')'))
                    .map(str::to_string)
            })
            .collect()
    }

    /// Render into `(allow, deny)` lists for the `--allowedTools`/`--disallowedTools`
    /// flags, in the CLI's rule syntax (see [`cli_rule`]).
    pub fn cli_rules(&self) -> (Vec<String>, Vec<String>) {
        let mut allow = Vec::new();
        let mut deny = Vec::new();

        for perm in self.permissions.values() {
            if !perm.allowed {
                deny.push(perm.tool.to_string());
                continue;
            }
            match perm.restrictions.as_deref() {
                Some(list) if !list.is_empty() => {
                    allow.extend(list.iter().map(|r| cli_rule(&format!("{}({r})", perm.tool))));
                }
                _ => allow.push(perm.tool.to_string()),
            }
        }

        allow.extend(self.rules.allow.iter().map(|p| cli_rule(p.as_str())));
        deny.extend(self.rules.deny.iter().map(|p| cli_rule(p.as_str())));
        (allow, deny)
    }

    pub fn summary(&self) -> PermissionSummary {
        let allowed = self.permissions.values().filter(|p| p.allowed).count();
        PermissionSummary {
            allowed_tools: allowed,
            denied_tools: self.permissions.len() - allowed,
            allow_rules: self.rules.allow.len(),
            deny_rules: self.rules.deny.len(),
        }
    }

    // ============== Persistence ==============

    pub fn export(&self) -> PermissionSnapshot {
        PermissionSnapshot {
            permissions: self.permissions.values().cloned().collect(),
            rules: self.rules.clone(),
        }
    }

    /// Replace the whole state with `snapshot`.
    pub fn import(&mut self, snapshot: PermissionSnapshot) {
        self.permissions = snapshot
            .permissions
            .into_iter()
            .map(|p| (p.tool, p))
            .collect();
        self.rules = snapshot.rules;
    }

    pub fn from_snapshot(snapshot: PermissionSnapshot) -> Self {
        let mut engine = Self::empty();
        engine.import(snapshot);
        engine
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: PermissionSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| Error::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&json)
    }
}

/// The CLI matches Bash rules by command prefix written as `Bash(prefix:*)`. A single
/// trailing `*` maps onto that form; anything else is passed through unchanged.
pub fn cli_rule(pattern: &str) -> String {
    let prefix = pattern
        .strip_prefix("Bash(")
        .and_then(|rest| rest.strip_suffix("*)"))
        .filter(|p| !p.is_empty() && !p.contains('*') && !p.ends_with(':'));
    match prefix {
        Some(p) => format!("Bash({}:*)", p.trim_end()),
        None => pattern.to_string(),
    }
}

fn push_unique(list: &mut Vec<Pattern>, pattern: Pattern) {
    if !list.contains(&pattern) {
        list.push(pattern);
    }
}
