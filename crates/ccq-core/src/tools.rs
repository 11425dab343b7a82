//! The closed set of tools a query may exercise.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// A named capability. Serialized with the names the Claude tooling uses, which are also
/// the names that appear in permission patterns such as `Bash(git*)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolName {
    Bash,
    Edit,
    Glob,
    Grep,
    #[serde(rename = "LS")]
    Ls,
    MultiEdit,
    NotebookEdit,
    NotebookRead,
    Read,
    Task,
    TodoWrite,
    WebFetch,
    WebSearch,
    Write,
}

impl ToolName {
    pub const ALL: [ToolName; 14] = [
        ToolName::Bash,
        ToolName::Edit,
        ToolName::Glob,
        ToolName::Grep,
        ToolName::Ls,
        ToolName::MultiEdit,
        ToolName::NotebookEdit,
        ToolName::NotebookRead,
        ToolName::Read,
        ToolName::Task,
        ToolName::TodoWrite,
        ToolName::WebFetch,
        ToolName::WebSearch,
        ToolName::Write,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::Bash => "Bash",
            ToolName::Edit => "Edit",
            ToolName::Glob => "Glob",
            ToolName::Grep => "Grep",
            ToolName::Ls => "LS",
            ToolName::MultiEdit => "MultiEdit",
            ToolName::NotebookEdit => "NotebookEdit",
            ToolName::NotebookRead => "NotebookRead",
            ToolName::Read => "Read",
            ToolName::Task => "Task",
            ToolName::TodoWrite => "TodoWrite",
            ToolName::WebFetch => "WebFetch",
            ToolName::WebSearch => "WebSearch",
            ToolName::Write => "Write",
        }
    }

    /// Tools that can modify the host (files or processes).
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            ToolName::Bash
                | ToolName::Edit
                | ToolName::MultiEdit
                | ToolName::NotebookEdit
                | ToolName::Write
        )
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown tool: {s}")))
    }
}
