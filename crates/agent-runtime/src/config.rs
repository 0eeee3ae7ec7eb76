//! Configuration File
//!
//! The JSON file naming the models and the MCP servers to start. Loading is
//! strict: anything that would leave the agent unable to run is a
//! [`ConfigError`] at startup rather than a surprise mid-conversation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use agent_core::{CollisionPolicy, GenerationOptions, ReasoningConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "mcp_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("no enabled MCP servers configured")]
    NoServers,

    #[error("no models configured")]
    NoModels,

    #[error("model '{0}' not found in configuration")]
    UnknownModel(String),

    #[error("unsupported provider '{0}'")]
    UnsupportedProvider(String),

    #[error("provider '{provider}' needs {setting}")]
    MissingSetting { provider: String, setting: String },
}

/// One entry of the `models` list
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub title: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Azure OpenAI deployment; defaults to `model`
    #[serde(default)]
    pub deployment: Option<String>,
    /// Azure OpenAI `api-version` query parameter
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "top_p")]
    pub top_p: Option<f32>,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    /// Name used for `--model` lookups: the title, else the model id
    pub fn name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.model)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.title.as_deref() == Some(name) || self.model == name
    }

    /// Generation options with this entry's overrides applied
    pub fn generation_options(&self) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        GenerationOptions {
            model: self.model.clone(),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            stop_sequences: Vec::new(),
        }
    }
}

/// One entry of the `mcpServers` map, as written in the file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,

    /// Auth provider name (e.g. `github`); the token comes from the environment
    #[serde(default)]
    pub provider: Option<String>,
    // OAuth client settings are accepted so existing files load; flows are
    // not run, only pre-issued tokens are used.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// How to reach a validated server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// Streamable HTTP: every message is a POST to `url`
    Http {
        url: String,
        headers: BTreeMap<String, String>,
        auth_provider: Option<String>,
    },
    /// Legacy HTTP+SSE: a GET event stream plus a POST endpoint it announces
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
        auth_provider: Option<String>,
    },
}

/// A validated, enabled server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub transport: TransportSpec,
}

impl ServerConfig {
    fn validate(&self, name: &str) -> Result<TransportSpec, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServer {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        match (&self.command, &self.url) {
            (Some(_), Some(_)) => Err(invalid("both 'command' and 'url' are set")),
            (None, None) => Err(invalid("one of 'command' or 'url' is required")),
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(invalid("'command' is empty"));
                }
                if let Some(t) = self.transport.as_deref().filter(|t| *t != "stdio") {
                    return Err(invalid(&format!("transport '{t}' needs a 'url'")));
                }
                Ok(TransportSpec::Stdio {
                    command: command.clone(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                })
            }
            (None, Some(url)) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid("'url' must be http(s)"));
                }
                let url = url.clone();
                let headers = self.headers.clone();
                let auth_provider = self.provider.clone();
                match self.transport.as_deref() {
                    None | Some("streamable-http" | "http") => Ok(TransportSpec::Http {
                        url,
                        headers,
                        auth_provider,
                    }),
                    Some("sse") => Ok(TransportSpec::Sse {
                        url,
                        headers,
                        auth_provider,
                    }),
                    Some(other) => Err(invalid(&format!("unknown transport '{other}'"))),
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Kept as a JSON map so file order survives
    #[serde(default)]
    pub mcp_servers: Map<String, Value>,

    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            models = config.models.len(),
            servers = config.mcp_servers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Enabled servers in file order; disabled ones are skipped
    pub fn servers(&self) -> Result<Vec<ServerSpec>, ConfigError> {
        let mut specs = Vec::new();
        for (name, raw) in &self.mcp_servers {
            let server: ServerConfig =
                serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidServer {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            if server.disabled {
                tracing::debug!(server = %name, "Skipping disabled server");
                continue;
            }
            specs.push(ServerSpec {
                name: name.clone(),
                transport: server.validate(name)?,
            });
        }
        if specs.is_empty() {
            return Err(ConfigError::NoServers);
        }
        Ok(specs)
    }

    /// The named model, else the one marked default, else the first
    pub fn choose_model(&self, name: Option<&str>) -> Result<&ModelConfig, ConfigError> {
        if let Some(name) = name {
            return self
                .models
                .iter()
                .find(|m| m.matches(name))
                .ok_or_else(|| ConfigError::UnknownModel(name.to_string()));
        }
        self.models
            .iter()
            .find(|m| m.default)
            .or_else(|| self.models.first())
            .ok_or(ConfigError::NoModels)
    }

    /// Full startup validation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        self.servers().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "models": [
            {"title": "local", "provider": "ollama", "model": "qwen2.5"},
            {"title": "gpt", "provider": "openai", "model": "gpt-4o", "default": true,
             "systemMessage": "Be brief.", "temperature": 0.2, "max_tokens": 512}
        ],
        "mcpServers": {
            "zeta": {"command": "uvx", "args": ["mcp-server-sqlite", "--db-path", "~/dolphin/demo.db"]},
            "alpha": {"url": "https://example.com/mcp", "transport": "streamable-http",
                      "headers": {"X-Key": "k"}, "provider": "github"},
            "legacy": {"url": "http://localhost:8000/sse", "transport": "sse"},
            "off": {"command": "x", "disabled": true}
        },
        "collisionPolicy": "qualify"
    }"#;

    fn parse(json: &str) -> AppConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_servers_keep_file_order_and_skip_disabled() {
        let config = parse(SAMPLE);
        let names: Vec<_> = config.servers().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "legacy"]);
        assert_eq!(config.collision_policy, CollisionPolicy::Qualify);
    }

    #[test]
    fn test_transport_specs() {
        let servers = parse(SAMPLE).servers().unwrap();
        assert!(matches!(&servers[0].transport, TransportSpec::Stdio { command, .. } if command == "uvx"));
        match &servers[1].transport {
            TransportSpec::Http {
                url,
                headers,
                auth_provider,
            } => {
                assert_eq!(url, "https://example.com/mcp");
                assert_eq!(headers["X-Key"], "k");
                assert_eq!(auth_provider.as_deref(), Some("github"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
        assert!(matches!(
            &servers[2].transport,
            TransportSpec::Sse { url, auth_provider: None, .. } if url == "http://localhost:8000/sse"
        ));
    }

    #[test]
    fn test_choose_model() {
        let config = parse(SAMPLE);
        assert_eq!(config.choose_model(None).unwrap().model, "gpt-4o");
        assert_eq!(config.choose_model(Some("local")).unwrap().model, "qwen2.5");
        assert_eq!(config.choose_model(Some("qwen2.5")).unwrap().name(), "local");
        assert!(matches!(
            config.choose_model(Some("missing")),
            Err(ConfigError::UnknownModel(_))
        ));

        let no_default = parse(r#"{"models": [{"provider": "ollama", "model": "a"}, {"provider": "ollama", "model": "b"}]}"#);
        assert_eq!(no_default.choose_model(None).unwrap().model, "a");
    }

    #[test]
    fn test_generation_options_overrides() {
        let config = parse(SAMPLE);
        let options = config.choose_model(Some("gpt")).unwrap().generation_options();
        assert_eq!(options.model, "gpt-4o");
        assert!((options.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(options.max_tokens, 512);
    }

    #[test]
    fn test_invalid_servers() {
        let both = parse(r#"{"mcpServers": {"x": {"command": "a", "url": "http://b"}}}"#);
        assert!(matches!(both.servers(), Err(ConfigError::InvalidServer { .. })));

        let neither = parse(r#"{"mcpServers": {"x": {"args": []}}}"#);
        assert!(matches!(neither.servers(), Err(ConfigError::InvalidServer { .. })));

        let empty = parse(r#"{"mcpServers": {"x": {"command": "  "}}}"#);
        assert!(matches!(empty.servers(), Err(ConfigError::InvalidServer { .. })));

        let transport = parse(r#"{"mcpServers": {"x": {"url": "http://b", "transport": "carrier-pigeon"}}}"#);
        let err = transport.servers().unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_no_enabled_servers_or_models() {
        let config = parse(r#"{"models": [{"provider": "ollama", "model": "a"}], "mcpServers": {"off": {"command": "x", "disabled": true}}}"#);
        assert!(matches!(config.validate(), Err(ConfigError::NoServers)));

        let config = parse(r#"{"mcpServers": {"on": {"command": "x"}}}"#);
        assert!(matches!(config.validate(), Err(ConfigError::NoModels)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.reasoning.max_iterations, 10);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            AppConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Read { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(AppConfig::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
