//! Named bundles of tool flags and rules applied to the permission engine in bulk.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, permissions::GlobalRules, tools::ToolName, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioPreset {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub allowed_tools: Vec<ToolName>,
    #[serde(default)]
    pub denied_tools: Vec<ToolName>,
    #[serde(default)]
    pub rules: GlobalRules,
}

/// Short description of a preset for listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetInfo {
    pub name: String,
    pub display_name: String,
    pub allowed_tools: Vec<ToolName>,
    pub tool_count: usize,
}

impl ScenarioPreset {
    pub fn info(&self) -> PresetInfo {
        PresetInfo {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            allowed_tools: self.allowed_tools.clone(),
            tool_count: self.allowed_tools.len(),
        }
    }
}

fn preset(
    name: &str,
    display_name: &str,
    allowed_tools: &[ToolName],
    denied_tools: &[ToolName],
    allow: &[&str],
    deny: &[&str],
) -> Result<ScenarioPreset> {
    Ok(ScenarioPreset {
        name: name.to_string(),
        display_name: display_name.to_string(),
        allowed_tools: allowed_tools.to_vec(),
        denied_tools: denied_tools.to_vec(),
        rules: GlobalRules::new(allow, deny)?,
    })
}

fn builtin_presets() -> Result<Vec<ScenarioPreset>> {
    use ToolName::*;

    Ok(vec![
        preset(
            "readonly",
            "Read-only analysis",
            &[Read, Grep, Glob, Ls, WebSearch],
            &[Write, Edit, Bash, MultiEdit, WebFetch],
            &[],
            &["Write(*)", "Edit(*)", "Bash(*)", "MultiEdit(*)"],
        )?,
        preset(
            "content-generation",
            "Content generation",
            &[TodoWrite, Task, WebSearch, Read, WebFetch],
            &[Bash, Write, Edit, MultiEdit],
            &["WebFetch(*)"],
            &["Bash(*)", "Write(*)", "Edit(*)"],
        )?,
        preset(
            "development",
            "Full development",
            &[
                Read, Write, Edit, MultiEdit, Grep, Glob, Ls, TodoWrite, Task, WebSearch,
                WebFetch,
            ],
            &[],
            &[
                "Bash(npm*)",
                "Bash(yarn*)",
                "Bash(git*)",
                "Bash(python*)",
                "Bash(node*)",
            ],
            &[
                "Bash(rm*)",
                "Bash(sudo*)",
                "Bash(chmod 777*)",
                "Bash(curl * | sh)",
            ],
        )?,
    ])
}

/// `content_generation` and `content-generation` name the same preset.
fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

/// Built-in presets plus any loaded from disk, keyed by normalized name.
#[derive(Clone, Debug)]
pub struct PresetCatalog {
    presets: BTreeMap<String, ScenarioPreset>,
}

impl PresetCatalog {
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self {
            presets: BTreeMap::new(),
        };
        for p in builtin_presets()? {
            catalog.insert(p);
        }
        Ok(catalog)
    }

    /// Add or replace a preset.
    pub fn insert(&mut self, preset: ScenarioPreset) {
        self.presets.insert(normalize_name(&preset.name), preset);
    }

    /// Merge presets from a JSON file holding an array of presets.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let json = fs::read_to_string(path).map_err(|e| Error::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let presets: Vec<ScenarioPreset> = serde_json::from_str(&json)?;
        let n = presets.len();
        for p in presets {
            self.insert(p);
        }
        Ok(n)
    }

    pub fn get(&self, name: &str) -> Result<&ScenarioPreset> {
        self.presets
            .get(&normalize_name(name))
            .ok_or_else(|| Error::Config(format!("unknown preset: {name}")))
    }

    pub fn info(&self, name: &str) -> Option<PresetInfo> {
        self.presets.get(&normalize_name(name)).map(|p| p.info())
    }

    pub fn names(&self) -> Vec<&str> {
        self.presets.values().map(|p| p.name.as_str()).collect()
    }
}
