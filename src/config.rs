//! Configuration for agentdeck, read from `.agentdeck/agentdeck.toml`.
//!
//! Layering is file → environment → CLI: each later layer overrides the
//! one before it.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3141
//! host = "127.0.0.1"
//! db_path = ".agentdeck/agentdeck.db"
//! dev_mode = false
//!
//! [agent]
//! command = "claude"
//! default_model = "sonnet"
//! allowed_tools = ["Read", "Edit", "Bash"]
//! disallowed_tools = ["WebFetch"]
//! thinking_tokens = 31999
//! history_limit = 20
//! stderr_limit = 4000
//! tool_result_limit = 2000
//! turn_timeout_secs = 1800
//!
//! [gateway]
//! subscriber_buffer = 256
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! directory = ".agentdeck/logs"
//! ```
//!
//! Environment overrides: `AGENTDECK_AGENT_CMD` (or `CLAUDE_CMD`) for the
//! agent command, `AGENTDECK_PORT` for the listen port.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentdeck_protocol::PermissionMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chat::context::AgentSettings;
use crate::chat::gateway::DEFAULT_SUBSCRIBER_BUFFER;
use crate::chat::translator::TOOL_RESULT_LIMIT;

pub const CONFIG_DIR: &str = ".agentdeck";
pub const CONFIG_FILE: &str = "agentdeck.toml";

pub const ENV_AGENT_CMD: &str = "AGENTDECK_AGENT_CMD";
pub const ENV_CLAUDE_CMD: &str = "CLAUDE_CMD";
pub const ENV_PORT: &str = "AGENTDECK_PORT";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Relative paths resolve against the project directory
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS and listen on all interfaces
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3141
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("agentdeck.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Agent CLI invocation and tool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Appended to the agent's system prompt on every turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tools allowed in `standard` mode. Empty means the agent's own default.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools denied in every mode
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default = "default_thinking_tokens")]
    pub thinking_tokens: u32,
    /// Transcript entries replayed into each prompt
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Characters of stderr kept for failure reports
    #[serde(default = "default_stderr_limit")]
    pub stderr_limit: usize,
    /// Characters of each tool result forwarded to clients
    #[serde(default = "default_tool_result_limit")]
    pub tool_result_limit: usize,
    /// Turns running longer than this are stopped. Unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_timeout_secs: Option<u64>,
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_thinking_tokens() -> u32 {
    31999
}

fn default_history_limit() -> usize {
    20
}

fn default_stderr_limit() -> usize {
    4000
}

fn default_tool_result_limit() -> usize {
    TOOL_RESULT_LIMIT
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            default_model: default_model(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            thinking_tokens: default_thinking_tokens(),
            history_limit: default_history_limit(),
            stderr_limit: default_stderr_limit(),
            tool_result_limit: default_tool_result_limit(),
            turn_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Outbound messages buffered per connection before it is dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rolling log files here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Tools available in a permission mode, or `None` when the mode does not
/// restrict the list itself.
pub fn tools_for_permission_mode(mode: PermissionMode) -> Option<Vec<String>> {
    match mode {
        PermissionMode::Readonly => Some(
            ["Read", "Glob", "Grep", "WebSearch", "WebFetch"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        ),
        PermissionMode::Standard | PermissionMode::Autonomous => None,
    }
}

/// The complete agentdeck.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentdeckToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AgentdeckToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agentdeck.toml")
    }

    /// Load `<config_dir>/agentdeck.toml`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize agentdeck.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Return a warning for every setting that is legal TOML but unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be chosen on every start".into());
        }
        if self.agent.default_model.trim().is_empty() {
            warnings.push("agent.default_model is empty".into());
        }
        if let Some(command) = &self.agent.command
            && command.trim().is_empty()
        {
            warnings.push("agent.command is empty".into());
        }
        if self.agent.stderr_limit == 0 {
            warnings.push("agent.stderr_limit is 0; failed turns will carry no stderr".into());
        }
        if self.agent.tool_result_limit == 0 {
            warnings.push("agent.tool_result_limit is 0; tool results will be empty".into());
        }
        if self.agent.turn_timeout_secs == Some(0) {
            warnings.push("agent.turn_timeout_secs is 0; every turn would be stopped at once".into());
        }
        for tool in &self.agent.allowed_tools {
            if self.agent.disallowed_tools.contains(tool) {
                warnings.push(format!(
                    "Tool '{}' is in both agent.allowed_tools and agent.disallowed_tools",
                    tool
                ));
            }
        }
        if self.gateway.subscriber_buffer == 0 {
            warnings.push("gateway.subscriber_buffer is 0; it will be raised to 1".into());
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.logging.level) {
            warnings.push(format!("Invalid logging.level '{}': {}", self.logging.level, e));
        }

        warnings
    }
}

/// Values taken from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub agent_command: Option<String>,
    pub port: Option<u16>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve overrides through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_command = get(ENV_AGENT_CMD).or_else(|| get(ENV_CLAUDE_CMD));
        let port = match get(ENV_PORT) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u16>()
                    .with_context(|| format!("{} must be a port number, got '{}'", ENV_PORT, raw))?,
            ),
            None => None,
        };

        Ok(Self {
            agent_command,
            port,
        })
    }
}

/// Overrides given as `serve` flags.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev_mode: bool,
}

/// Effective configuration: agentdeck.toml, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct AgentdeckConfig {
    pub project_dir: PathBuf,
    /// The `.agentdeck` directory inside the project
    pub config_dir: PathBuf,
    pub toml: AgentdeckToml,
    pub env: EnvOverrides,
    pub cli: CliOverrides,
}

impl AgentdeckConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, EnvOverrides::from_env()?)
    }

    pub fn with_env(project_dir: PathBuf, env: EnvOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = AgentdeckToml::load_or_default(&config_dir)?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
            env,
            cli: CliOverrides::default(),
        })
    }

    pub fn with_cli_overrides(mut self, cli: CliOverrides) -> Self {
        self.cli = cli;
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn port(&self) -> u16 {
        self.cli
            .port
            .or(self.env.port)
            .unwrap_or(self.toml.server.port)
    }

    pub fn dev_mode(&self) -> bool {
        self.cli.dev_mode || self.toml.server.dev_mode
    }

    /// Listen address host. Dev mode listens on every interface.
    pub fn host(&self) -> String {
        if self.dev_mode() {
            "0.0.0.0".to_string()
        } else {
            self.toml.server.host.clone()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        let path = self
            .cli
            .db_path
            .clone()
            .unwrap_or_else(|| self.toml.server.db_path.clone());
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn agent_command(&self) -> String {
        self.env
            .agent_command
            .clone()
            .or_else(|| self.toml.agent.command.clone())
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.toml.gateway.subscriber_buffer.max(1)
    }

    pub fn logging(&self) -> LoggingSection {
        let mut logging = self.toml.logging.clone();
        if let Some(dir) = &logging.directory
            && dir.is_relative()
        {
            logging.directory = Some(self.project_dir.join(dir));
        }
        logging
    }

    pub fn agent_settings(&self) -> AgentSettings {
        let agent = &self.toml.agent;
        AgentSettings {
            command: self.agent_command(),
            default_model: agent.default_model.clone(),
            system_prompt: agent.system_prompt.clone(),
            allowed_tools: agent.allowed_tools.clone(),
            disallowed_tools: agent.disallowed_tools.clone(),
            thinking_tokens: agent.thinking_tokens,
            history_limit: agent.history_limit,
            stderr_limit: agent.stderr_limit,
            tool_result_limit: agent.tool_result_limit,
            turn_timeout: agent
                .turn_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = AgentdeckToml::parse("").unwrap();
        assert_eq!(toml.server.port, 3141);
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.agent.default_model, "sonnet");
        assert_eq!(toml.agent.history_limit, 20);
        assert_eq!(toml.agent.tool_result_limit, 2000);
        assert_eq!(toml.gateway.subscriber_buffer, 256);
        assert_eq!(toml.logging.format, LogFormat::Pretty);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[server]
port = 8080
dev_mode = true

[agent]
command = "my-claude"
default_model = "opus"
allowed_tools = ["Read", "Edit"]
disallowed_tools = ["Bash"]
turn_timeout_secs = 600

[gateway]
subscriber_buffer = 32

[logging]
level = "agentdeck=debug"
format = "json"
directory = "logs"
"#;
        let toml = AgentdeckToml::parse(content).unwrap();
        assert_eq!(toml.server.port, 8080);
        assert!(toml.server.dev_mode);
        assert_eq!(toml.agent.command.as_deref(), Some("my-claude"));
        assert_eq!(toml.agent.allowed_tools, vec!["Read", "Edit"]);
        assert_eq!(toml.agent.turn_timeout_secs, Some(600));
        assert_eq!(toml.gateway.subscriber_buffer, 32);
        assert_eq!(toml.logging.format, LogFormat::Json);
        assert_eq!(toml.logging.directory, Some(PathBuf::from("logs")));
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        assert!(AgentdeckToml::parse("[server]\nport = \"eighty\"").is_err());
        assert!(AgentdeckToml::parse("[logging]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn test_validate_flags_unusable_values() {
        let mut toml = AgentdeckToml::default();
        toml.agent.allowed_tools = vec!["Bash".into()];
        toml.agent.disallowed_tools = vec!["Bash".into()];
        toml.agent.turn_timeout_secs = Some(0);
        toml.gateway.subscriber_buffer = 0;
        toml.logging.level = "agentdeck=loud".into();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 4, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("'Bash'")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = AgentdeckToml::default();
        toml.server.port = 9000;
        toml.agent.system_prompt = Some("be brief".into());
        toml.save(&path).unwrap();

        let loaded = AgentdeckToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9000);
        assert_eq!(loaded.agent.system_prompt.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_readonly_mode_restricts_tools() {
        let tools = tools_for_permission_mode(PermissionMode::Readonly).unwrap();
        assert!(tools.contains(&"Read".to_string()));
        assert!(!tools.contains(&"Bash".to_string()));
        assert!(tools_for_permission_mode(PermissionMode::Standard).is_none());
        assert!(tools_for_permission_mode(PermissionMode::Autonomous).is_none());
    }

    #[test]
    fn test_env_overrides_prefer_agentdeck_variable() {
        let env = EnvOverrides::from_lookup(lookup(&[
            (ENV_AGENT_CMD, "deck-agent"),
            (ENV_CLAUDE_CMD, "claude-beta"),
            (ENV_PORT, "4000"),
        ]))
        .unwrap();
        assert_eq!(env.agent_command.as_deref(), Some("deck-agent"));
        assert_eq!(env.port, Some(4000));

        let env = EnvOverrides::from_lookup(lookup(&[(ENV_CLAUDE_CMD, "claude-beta"), (ENV_AGENT_CMD, " ")]))
            .unwrap();
        assert_eq!(env.agent_command.as_deref(), Some("claude-beta"));
    }

    #[test]
    fn test_env_port_must_parse() {
        let err = EnvOverrides::from_lookup(lookup(&[(ENV_PORT, "http")])).unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn test_layering_file_then_env_then_cli() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            "[server]\nport = 5000\n[agent]\ncommand = \"file-agent\"\n",
        )
        .unwrap();

        let config = AgentdeckConfig::with_env(dir.path().to_path_buf(), EnvOverrides::default()).unwrap();
        assert_eq!(config.port(), 5000);
        assert_eq!(config.agent_command(), "file-agent");

        let env = EnvOverrides {
            agent_command: Some("env-agent".into()),
            port: Some(6000),
        };
        let config = AgentdeckConfig::with_env(dir.path().to_path_buf(), env).unwrap();
        assert_eq!(config.port(), 6000);
        assert_eq!(config.agent_settings().command, "env-agent");

        let config = config.with_cli_overrides(CliOverrides {
            port: Some(7000),
            db_path: Some(PathBuf::from("/tmp/other.db")),
            dev_mode: true,
        });
        assert_eq!(config.port(), 7000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/other.db"));
        assert_eq!(config.host(), "0.0.0.0");
    }

    #[test]
    fn test_relative_paths_resolve_against_project() {
        let dir = tempdir().unwrap();
        let config = AgentdeckConfig::with_env(dir.path().to_path_buf(), EnvOverrides::default()).unwrap();
        assert_eq!(config.db_path(), config.project_dir.join(".agentdeck/agentdeck.db"));
        assert_eq!(config.host(), "127.0.0.1");
        assert_eq!(config.agent_command(), "claude");
    }

    #[test]
    fn test_agent_settings_carry_file_values() {
        let mut toml = AgentdeckToml::default();
        toml.agent.history_limit = 5;
        toml.agent.turn_timeout_secs = Some(90);
        toml.agent.disallowed_tools = vec!["WebFetch".into()];
        let dir = tempdir().unwrap();
        let config = AgentdeckConfig {
            project_dir: dir.path().to_path_buf(),
            config_dir: dir.path().join(CONFIG_DIR),
            toml,
            env: EnvOverrides::default(),
            cli: CliOverrides::default(),
        };
        let settings = config.agent_settings();
        assert_eq!(settings.history_limit, 5);
        assert_eq!(settings.turn_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.disallowed_tools, vec!["WebFetch".to_string()]);
    }
}
