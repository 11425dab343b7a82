use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tracing::info;

use crate::{
    errors::Error,
    model::{
        client::ClaudeCliConfig,
        types::{OutputFormat, QueryOptions, DEFAULT_MAX_TURNS, DEFAULT_TEMPERATURE},
    },
    permissions::PermissionEngine,
    presets::PresetCatalog,
    query::ClientSettings,
    retry::RetryPolicy,
    session::DEFAULT_MAX_HISTORY,
    Result,
};

/// Typed configuration shared by the client, the worker, and the binary.
#[derive(Clone, Debug)]
pub struct Config {
    // Retry
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    // Query defaults
    /// `None` disables the request timeout.
    pub query_timeout: Option<Duration>,
    pub max_turns: u32,
    pub temperature: f32,
    pub output_format: OutputFormat,

    // Sessions
    pub max_history: usize,

    /// Where the worker writes its metrics summary on shutdown.
    pub metrics_file: Option<PathBuf>,

    // Permissions
    pub preset: Option<String>,
    pub permissions_file: Option<PathBuf>,
    pub presets_file: Option<PathBuf>,

    // Claude CLI
    pub claude_cli_path: PathBuf,
    pub claude_model: Option<String>,
    pub working_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            query_timeout: Some(Duration::from_secs(180)),
            max_turns: DEFAULT_MAX_TURNS,
            temperature: DEFAULT_TEMPERATURE,
            output_format: OutputFormat::Stream,
            max_history: DEFAULT_MAX_HISTORY,
            metrics_file: None,
            preset: None,
            permissions_file: None,
            presets_file: None,
            claude_cli_path: PathBuf::from("/usr/local/bin/claude"),
            claude_model: None,
            working_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load from the environment, after reading `.env` from the current directory.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);

        let max_attempts = parse(&get, "CCQ_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(Error::Config("CCQ_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        let retry_base_delay = parse(&get, "CCQ_RETRY_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_base_delay);
        let retry_max_delay = parse(&get, "CCQ_RETRY_MAX_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_max_delay);

        // 0 disables the timeout.
        let query_timeout = match parse::<u64, _>(&get, "CCQ_QUERY_TIMEOUT_MS")? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.query_timeout,
        };

        let max_turns = parse(&get, "CCQ_MAX_TURNS")?.unwrap_or(defaults.max_turns);
        if max_turns == 0 {
            return Err(Error::Config("CCQ_MAX_TURNS must be at least 1".to_string()));
        }
        let temperature = parse(&get, "CCQ_TEMPERATURE")?.unwrap_or(defaults.temperature);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(Error::Config(format!(
                "CCQ_TEMPERATURE must be within 0..=1, got {temperature}"
            )));
        }
        let output_format = match get("CCQ_OUTPUT_FORMAT") {
            Some(s) => OutputFormat::parse(&s)?,
            None => defaults.output_format,
        };

        let max_history = parse(&get, "CCQ_MAX_HISTORY")?.unwrap_or(defaults.max_history);
        if max_history == 0 {
            return Err(Error::Config("CCQ_MAX_HISTORY must be at least 1".to_string()));
        }

        let claude_cli_path = get("CLAUDE_CLI_PATH")
            .map(PathBuf::from)
            .or_else(|| which_in_path("claude"))
            .unwrap_or(defaults.claude_cli_path);
        let working_dir = get("CCQ_WORKING_DIR")
            .map(PathBuf::from)
            .or_else(|| env::current_dir().ok())
            .unwrap_or(defaults.working_dir);

        Ok(Self {
            max_attempts,
            retry_base_delay,
            retry_max_delay,
            query_timeout,
            max_turns,
            temperature,
            output_format,
            max_history,
            metrics_file: get("CCQ_METRICS_FILE").map(PathBuf::from),
            preset: get("CCQ_PRESET"),
            permissions_file: get("CCQ_PERMISSIONS_FILE").map(PathBuf::from),
            presets_file: get("CCQ_PRESETS_FILE").map(PathBuf::from),
            claude_cli_path,
            claude_model: get("CLAUDE_MODEL"),
            working_dir,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Options every query starts from before caller options are layered on.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions {
            max_turns: Some(self.max_turns),
            temperature: Some(self.temperature),
            output_format: Some(self.output_format),
            timeout_ms: Some(
                self.query_timeout
                    .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or(0),
            ),
            model: self.claude_model.clone(),
            ..Default::default()
        }
    }

    /// Built-in presets plus those from `CCQ_PRESETS_FILE`.
    pub fn preset_catalog(&self) -> Result<PresetCatalog> {
        let mut catalog = PresetCatalog::builtin()?;
        if let Some(path) = &self.presets_file {
            let n = catalog.load_file(path)?;
            info!(path = %path.display(), presets = n, "loaded presets");
        }
        Ok(catalog)
    }

    /// The saved engine from `CCQ_PERMISSIONS_FILE` (or the defaults), with `CCQ_PRESET`
    /// applied on top.
    pub fn permission_engine(&self, catalog: &PresetCatalog) -> Result<PermissionEngine> {
        let mut engine = match &self.permissions_file {
            Some(path) => PermissionEngine::load(path)?,
            None => PermissionEngine::default(),
        };
        if let Some(name) = &self.preset {
            engine.apply_preset(catalog.get(name)?);
            info!(preset = %name, "applied permission preset");
        }
        Ok(engine)
    }

    /// Everything a `QueryClient` is built from.
    pub fn client_settings(&self) -> Result<ClientSettings> {
        let presets = self.preset_catalog()?;
        let engine = self.permission_engine(&presets)?;
        Ok(ClientSettings {
            retry: self.retry_policy(),
            defaults: self.default_options(),
            max_history: self.max_history,
            engine,
            presets,
        })
    }

    pub fn claude_cli_config(&self) -> ClaudeCliConfig {
        ClaudeCliConfig {
            claude_path: self.claude_cli_path.clone(),
            model: self.claude_model.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}")))
        })
        .transpose()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.query_timeout, Some(Duration::from_secs(180)));
        assert_eq!(cfg.max_turns, 3);
        assert_eq!(cfg.output_format, OutputFormat::Stream);
        assert!(cfg.preset.is_none());
    }

    #[test]
    fn values_are_parsed_and_zero_disables_the_timeout() {
        let cfg = from_pairs(&[
            ("CCQ_MAX_ATTEMPTS", "5"),
            ("CCQ_RETRY_BASE_MS", "10"),
            ("CCQ_QUERY_TIMEOUT_MS", "0"),
            ("CCQ_TEMPERATURE", "0.2"),
            ("CCQ_OUTPUT_FORMAT", "JSON"),
            ("CCQ_PRESET", "readonly"),
            ("CLAUDE_CLI_PATH", "/opt/claude"),
            ("CLAUDE_MODEL", "sonnet"),
            ("CCQ_WORKING_DIR", "/srv/work"),
        ])
        .unwrap();

        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(10));
        assert!(cfg.query_timeout.is_none());
        assert_eq!(cfg.output_format, OutputFormat::Json);
        assert_eq!(cfg.preset.as_deref(), Some("readonly"));

        let opts = cfg.default_options();
        assert_eq!(opts.timeout(), None);
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.model.as_deref(), Some("sonnet"));

        let cli = cfg.claude_cli_config();
        assert_eq!(cli.claude_path, PathBuf::from("/opt/claude"));
        assert_eq!(cli.working_dir, PathBuf::from("/srv/work"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for pairs in [
            [("CCQ_MAX_ATTEMPTS", "many")],
            [("CCQ_MAX_ATTEMPTS", "0")],
            [("CCQ_TEMPERATURE", "1.5")],
            [("CCQ_OUTPUT_FORMAT", "yaml")],
            [("CCQ_MAX_TURNS", "0")],
            [("CCQ_MAX_HISTORY", "0")],
        ] {
            assert!(
                matches!(from_pairs(&pairs), Err(Error::Config(_))),
                "{pairs:?} should be rejected"
            );
        }
    }

    #[test]
    fn preset_is_applied_over_the_saved_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        let mut saved = PermissionEngine::default();
        saved.set_tool_permission(crate::tools::ToolName::NotebookRead, true, None);
        saved.save(&path).unwrap();

        let cfg = Config {
            permissions_file: Some(path),
            preset: Some("readonly".into()),
            ..Config::default()
        };
        let catalog = cfg.preset_catalog().unwrap();
        let engine = cfg.permission_engine(&catalog).unwrap();

        use crate::tools::ToolName;
        assert!(engine.is_allowed(ToolName::NotebookRead, None));
        assert!(engine.is_allowed(ToolName::Ls, None));
        assert!(!engine.is_allowed(ToolName::Bash, None));
        assert_eq!(engine.rules(), &catalog.get("readonly").unwrap().rules);
    }

    #[test]
    fn unknown_preset_fails_engine_construction() {
        let cfg = Config {
            preset: Some("chaos".into()),
            ..Config::default()
        };
        let catalog = cfg.preset_catalog().unwrap();
        assert!(matches!(cfg.permission_engine(&catalog), Err(Error::Config(_))));
        assert!(cfg.client_settings().is_err());
    }

    #[test]
    fn client_settings_bundle_retry_defaults_and_engine() {
        let cfg = from_pairs(&[
            ("CCQ_MAX_ATTEMPTS", "4"),
            ("CCQ_PRESET", "development"),
            ("CCQ_MAX_HISTORY", "20"),
            ("CCQ_METRICS_FILE", "/tmp/ccq-metrics.json"),
        ])
        .unwrap();
        assert_eq!(cfg.metrics_file, Some(PathBuf::from("/tmp/ccq-metrics.json")));
        let settings = cfg.client_settings().unwrap();
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.max_history, 20);
        assert_eq!(settings.defaults.max_turns, Some(3));
        assert!(settings
            .engine
            .is_allowed(crate::tools::ToolName::Write, None));
        assert!(settings.presets.get("readonly").is_ok());
    }

    #[test]
    fn dotenv_does_not_override_existing_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nCCQ_TEST_DOTENV_NEW=\"from file\"\nCCQ_TEST_DOTENV_SET=from file\n",
        )
        .unwrap();
        env::set_var("CCQ_TEST_DOTENV_SET", "from env");

        load_dotenv_if_present(&path);
        assert_eq!(env::var("CCQ_TEST_DOTENV_NEW").unwrap(), "from file");
        assert_eq!(env::var("CCQ_TEST_DOTENV_SET").unwrap(), "from env");
    }
}
