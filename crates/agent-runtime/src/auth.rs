//! Request headers for remote MCP servers
//!
//! Token acquisition flows are out of scope: a bearer token is read from the
//! environment and attached to every request.

use agent_core::Result;
use async_trait::async_trait;

/// Supplies headers for every outgoing request to a remote server
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers(&self) -> Result<Vec<(String, String)>>;
}

/// `User-Agent` sent to remote servers
pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Static bearer token
#[derive(Clone)]
pub struct BearerTokenAuth {
    token: String,
}

impl BearerTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Look the token up in the process environment
    pub fn from_env(provider: Option<&str>, server: &str) -> Option<Self> {
        Self::lookup(provider, server, |key| std::env::var(key).ok())
    }

    /// First non-empty value among [`token_vars`]
    pub fn lookup(
        provider: Option<&str>,
        server: &str,
        get: impl Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        token_vars(provider, server)
            .iter()
            .find_map(|key| get(key).filter(|v| !v.trim().is_empty()))
            .map(Self::new)
    }
}

impl std::fmt::Debug for BearerTokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokenAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl HeaderProvider for BearerTokenAuth {
    async fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("Authorization".into(), format!("Bearer {}", self.token))])
    }
}

/// Variables consulted for a server's token, in priority order:
/// `<PROVIDER>_TOKEN`, then `MCP_<SERVER>_TOKEN`
pub fn token_vars(provider: Option<&str>, server: &str) -> Vec<String> {
    provider
        .map(|p| format!("{}_TOKEN", env_segment(p)))
        .into_iter()
        .chain(std::iter::once(format!("MCP_{}_TOKEN", env_segment(server))))
        .collect()
}

fn env_segment(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_token_vars() {
        assert_eq!(token_vars(Some("github"), "gh-tools"), vec!["GITHUB_TOKEN", "MCP_GH_TOOLS_TOKEN"]);
        assert_eq!(token_vars(None, "my.server"), vec!["MCP_MY_SERVER_TOKEN"]);
    }

    #[tokio::test]
    async fn test_lookup_prefers_provider_token() {
        let env: HashMap<&str, &str> = [("GITHUB_TOKEN", "ghp_1"), ("MCP_GH_TOKEN", "other")].into();
        let auth = BearerTokenAuth::lookup(Some("github"), "gh", |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(
            auth.headers().await.unwrap(),
            vec![("Authorization".to_string(), "Bearer ghp_1".to_string())]
        );
    }

    #[test]
    fn test_lookup_skips_blank_values() {
        let env: HashMap<&str, &str> = [("GITHUB_TOKEN", "  "), ("MCP_GH_TOKEN", "tok")].into();
        assert!(BearerTokenAuth::lookup(Some("github"), "gh", |k| env.get(k).map(ToString::to_string)).is_some());
        assert!(BearerTokenAuth::lookup(None, "other", |k| env.get(k).map(ToString::to_string)).is_none());
    }

    #[test]
    fn test_user_agent_names_crate() {
        assert!(user_agent().starts_with("agent-runtime/"));
    }
}
