//! Turning configuration entries into live collaborators

use std::sync::Arc;

use agent_core::{LlmProvider, ProviderSession, ServerId, SessionManager};

use crate::anthropic::{self, AnthropicProvider};
use crate::auth::{BearerTokenAuth, HeaderProvider};
use crate::config::{ConfigError, ModelConfig, ServerSpec, TransportSpec};
use crate::mcp::{HttpSession, SseSession, StdioSession};
use crate::openai::{self, OpenAiProvider};

pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn missing(model: &ModelConfig, setting: &str) -> ConfigError {
    ConfigError::MissingSetting {
        provider: model.provider.clone(),
        setting: setting.into(),
    }
}

/// Provider for a `models` entry
///
/// `apiKey`/`apiBase` in the entry win over the environment.
pub fn build_provider(model: &ModelConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let provider: Arc<dyn LlmProvider> = match model.provider.to_ascii_lowercase().as_str() {
        "openai" => Arc::new(OpenAiProvider::new(
            model
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            model
                .api_base
                .clone()
                .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
                .unwrap_or_else(|| openai::DEFAULT_BASE_URL.into()),
        )),
        "anthropic" => Arc::new(AnthropicProvider::new(
            model
                .api_key
                .clone()
                .or_else(|| env("ANTHROPIC_API_KEY"))
                .ok_or_else(|| missing(model, "apiKey or ANTHROPIC_API_KEY"))?,
            model
                .api_base
                .clone()
                .unwrap_or_else(|| anthropic::DEFAULT_BASE_URL.into()),
        )),
        "msazureopenai" | "azure" => Arc::new(OpenAiProvider::azure(
            model.api_key.clone().or_else(|| env("AZURE_OPENAI_API_KEY")),
            model
                .api_base
                .clone()
                .or_else(|| env("AZURE_OPENAI_API_ENDPOINT"))
                .ok_or_else(|| missing(model, "apiBase or AZURE_OPENAI_API_ENDPOINT"))?,
            model
                .deployment
                .clone()
                .or_else(|| env("AZURE_OPENAI_DEPLOYMENT_ID"))
                .unwrap_or_else(|| model.model.clone()),
            model
                .api_version
                .clone()
                .or_else(|| env("AZURE_OPENAI_API_VERSION"))
                .unwrap_or_else(|| openai::DEFAULT_AZURE_API_VERSION.into()),
        )),
        "lmstudio" => Arc::new(
            OpenAiProvider::new(
                model.api_key.clone(),
                model.api_base.clone().unwrap_or_else(|| LMSTUDIO_BASE_URL.into()),
            )
            .with_name("LM Studio"),
        ),
        #[cfg(feature = "ollama")]
        "ollama" => {
            use crate::ollama::{OllamaConfig, OllamaProvider};
            let config = model
                .api_base
                .as_deref()
                .and_then(OllamaConfig::from_base_url)
                .unwrap_or_else(OllamaConfig::from_env);
            Arc::new(OllamaProvider::from_config(&config))
        }
        _ => return Err(ConfigError::UnsupportedProvider(model.provider.clone())),
    };
    tracing::debug!(provider = %model.provider, model = %model.model, "Provider ready");
    Ok(provider)
}

/// Unconnected transport for one server
pub fn build_session(spec: &ServerSpec) -> Arc<dyn ProviderSession> {
    let id = ServerId::new(&spec.name);
    match &spec.transport {
        TransportSpec::Stdio { command, args, env } => {
            Arc::new(StdioSession::new(id, command, args.clone(), env.clone()))
        }
        TransportSpec::Http {
            url,
            headers,
            auth_provider,
        } => {
            let mut session = HttpSession::new(id, url).with_headers(headers.clone());
            if let Some(auth) = auth_for(&spec.name, auth_provider.as_deref()) {
                session = session.with_auth(auth);
            }
            Arc::new(session)
        }
        TransportSpec::Sse {
            url,
            headers,
            auth_provider,
        } => {
            let mut session = SseSession::new(id, url).with_headers(headers.clone());
            if let Some(auth) = auth_for(&spec.name, auth_provider.as_deref()) {
                session = session.with_auth(auth);
            }
            Arc::new(session)
        }
    }
}

fn auth_for(server: &str, auth_provider: Option<&str>) -> Option<Arc<dyn HeaderProvider>> {
    match BearerTokenAuth::from_env(auth_provider, server) {
        Some(auth) => Some(Arc::new(auth)),
        None => {
            if auth_provider.is_some() {
                tracing::warn!(
                    server = %server,
                    "No token found in the environment; connecting without credentials"
                );
            }
            None
        }
    }
}

/// A manager holding one session per spec, in configuration order
pub fn session_manager(specs: &[ServerSpec]) -> SessionManager {
    let mut manager = SessionManager::new();
    for spec in specs {
        manager.add(ServerId::new(&spec.name), build_session(spec));
    }
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn model(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model: "m".into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_known_providers() {
        let lmstudio = build_provider(&model("lmstudio")).unwrap();
        assert!(lmstudio.supports_native_tools());

        let openai = build_provider(&ModelConfig {
            api_key: Some("sk-test".into()),
            api_base: Some("http://127.0.0.1:9/v1".into()),
            ..model("OpenAI")
        })
        .unwrap();
        assert!(openai.supports_native_tools());
    }

    #[cfg(feature = "ollama")]
    #[test]
    fn test_ollama_is_text_only() {
        let ollama = build_provider(&model("ollama")).unwrap();
        assert!(!ollama.supports_native_tools());
    }

    #[test]
    fn test_hosted_providers() {
        let anthropic = build_provider(&ModelConfig {
            api_key: Some("sk-ant".into()),
            ..model("anthropic")
        })
        .unwrap();
        assert!(anthropic.supports_native_tools());

        let azure = build_provider(&ModelConfig {
            api_key: Some("az-key".into()),
            api_base: Some("https://acme.openai.azure.com".into()),
            deployment: Some("gpt4o-prod".into()),
            api_version: Some("2024-06-01".into()),
            ..model("msazureopenai")
        })
        .unwrap();
        assert!(azure.supports_native_tools());
    }

    #[test]
    fn test_unsupported_provider() {
        assert!(matches!(
            build_provider(&model("bedrock")),
            Err(ConfigError::UnsupportedProvider(p)) if p == "bedrock"
        ));
    }

    #[test]
    fn test_manager_keeps_config_order() {
        let specs = vec![
            ServerSpec {
                name: "zeta".into(),
                transport: TransportSpec::Stdio {
                    command: "uvx".into(),
                    args: vec![],
                    env: BTreeMap::new(),
                },
            },
            ServerSpec {
                name: "alpha".into(),
                transport: TransportSpec::Http {
                    url: "https://example.com/mcp".into(),
                    headers: BTreeMap::new(),
                    auth_provider: None,
                },
            },
            ServerSpec {
                name: "legacy".into(),
                transport: TransportSpec::Sse {
                    url: "http://localhost:8000/sse".into(),
                    headers: BTreeMap::new(),
                    auth_provider: None,
                },
            },
        ];
        let manager = session_manager(&specs);
        let ids: Vec<&str> = manager.sessions().iter().map(|s| s.id().as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "legacy"]);
    }
}
