use crate::settings::{CredentialRuleSettings, CredentialSource};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::env;
use std::sync::Arc;

/// Username/password pair presented to a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Provider for registry authentication credentials
///
/// Decoupled from the gateway so that the gateway only asks "how do I
/// authenticate against this host" and new credential strategies can be
/// added without touching the sync logic.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Get credentials for a specific registry host
    ///
    /// Returns None for anonymous access.
    async fn get_credentials(&self, registry_host: &str) -> Result<Option<RegistryCredentials>>;
}

/// Predicate on registry hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatcher {
    Exact(String),
    /// Matches any host ending in the suffix (stored with its leading '.')
    Suffix(String),
}

impl HostMatcher {
    /// `*.example.com` becomes a suffix match, anything else an exact match
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => HostMatcher::Suffix(suffix.to_string()),
            _ => HostMatcher::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostMatcher::Exact(expected) => host == expected,
            HostMatcher::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
        }
    }
}

pub struct AnonymousProvider;

#[async_trait]
impl CredentialsProvider for AnonymousProvider {
    async fn get_credentials(&self, _registry_host: &str) -> Result<Option<RegistryCredentials>> {
        Ok(None)
    }
}

/// Fixed credentials from configuration
pub struct StaticProvider {
    credentials: RegistryCredentials,
}

impl StaticProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: RegistryCredentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticProvider {
    async fn get_credentials(&self, _registry_host: &str) -> Result<Option<RegistryCredentials>> {
        Ok(Some(self.credentials.clone()))
    }
}

/// Credentials read from environment variables on every call
pub struct EnvProvider {
    username_var: String,
    password_var: String,
}

impl EnvProvider {
    pub fn new(username_var: impl Into<String>, password_var: impl Into<String>) -> Self {
        Self {
            username_var: username_var.into(),
            password_var: password_var.into(),
        }
    }
}

#[async_trait]
impl CredentialsProvider for EnvProvider {
    async fn get_credentials(&self, registry_host: &str) -> Result<Option<RegistryCredentials>> {
        let username = env::var(&self.username_var).with_context(|| {
            format!(
                "{} must be set to authenticate against {}",
                self.username_var, registry_host
            )
        })?;
        let password = env::var(&self.password_var).with_context(|| {
            format!(
                "{} must be set to authenticate against {}",
                self.password_var, registry_host
            )
        })?;
        Ok(Some(RegistryCredentials { username, password }))
    }
}

/// Google Container Registry access via an OAuth2 access token
///
/// The token comes from `token_var` or, failing that, from
/// `gcloud auth print-access-token`. Without either, access falls back to
/// anonymous so public images stay reachable.
pub struct GoogleProvider {
    token_var: String,
}

impl GoogleProvider {
    const USERNAME: &'static str = "oauth2accesstoken";

    pub fn new(token_var: impl Into<String>) -> Self {
        Self {
            token_var: token_var.into(),
        }
    }

    async fn gcloud_token() -> Result<String> {
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .context("Failed to run gcloud")?;
        if !output.status.success() {
            bail!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let token = String::from_utf8(output.stdout)
            .context("gcloud returned a non UTF-8 token")?
            .trim()
            .to_string();
        if token.is_empty() {
            bail!("gcloud returned an empty access token");
        }
        Ok(token)
    }
}

#[async_trait]
impl CredentialsProvider for GoogleProvider {
    async fn get_credentials(&self, registry_host: &str) -> Result<Option<RegistryCredentials>> {
        let token = match env::var(&self.token_var) {
            Ok(token) if !token.is_empty() => token,
            _ => match Self::gcloud_token().await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(
                        "No Google access token for {} ({:#}), continuing anonymously",
                        registry_host,
                        e
                    );
                    return Ok(None);
                }
            },
        };
        Ok(Some(RegistryCredentials {
            username: Self::USERNAME.to_string(),
            password: token,
        }))
    }
}

struct CredentialRule {
    hosts: Vec<HostMatcher>,
    provider: Arc<dyn CredentialsProvider>,
}

/// Ordered host-predicate → provider mapping. The first matching rule wins,
/// hosts without a rule are accessed anonymously.
#[derive(Default)]
pub struct CredentialChain {
    rules: Vec<CredentialRule>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, hosts: Vec<HostMatcher>, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.rules.push(CredentialRule { hosts, provider });
        self
    }

    pub fn from_settings(rules: &[CredentialRuleSettings]) -> Self {
        rules.iter().fold(Self::new(), |chain, rule| {
            let hosts = rule.hosts.iter().map(|h| HostMatcher::parse(h)).collect();
            let provider: Arc<dyn CredentialsProvider> = match &rule.source {
                CredentialSource::Anonymous => Arc::new(AnonymousProvider),
                CredentialSource::Basic { username, password } => {
                    Arc::new(StaticProvider::new(username, password))
                }
                CredentialSource::Env {
                    username_var,
                    password_var,
                } => Arc::new(EnvProvider::new(username_var, password_var)),
                CredentialSource::Google { token_var } => Arc::new(GoogleProvider::new(token_var)),
            };
            chain.with_rule(hosts, provider)
        })
    }

    /// Credentials for `registry_host`, None meaning anonymous access
    pub async fn resolve(&self, registry_host: &str) -> Result<Option<RegistryCredentials>> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.hosts.iter().any(|m| m.matches(registry_host)));

        match rule {
            Some(rule) => rule.provider.get_credentials(registry_host).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matcher() {
        let exact = HostMatcher::parse("gcr.io");
        assert!(exact.matches("gcr.io"));
        assert!(!exact.matches("eu.gcr.io"));

        let suffix = HostMatcher::parse("*.gcr.io");
        assert_eq!(suffix, HostMatcher::Suffix(".gcr.io".to_string()));
        assert!(suffix.matches("eu.gcr.io"));
        assert!(!suffix.matches("gcr.io"));
        assert!(!suffix.matches("evilgcr.io"));
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let chain = CredentialChain::new()
            .with_rule(
                vec![HostMatcher::parse("*.example.com")],
                Arc::new(StaticProvider::new("first", "a")),
            )
            .with_rule(
                vec![HostMatcher::parse("registry.example.com")],
                Arc::new(StaticProvider::new("second", "b")),
            );

        let creds = chain.resolve("registry.example.com").await.unwrap().unwrap();
        assert_eq!(creds.username, "first");
        assert!(chain.resolve("quay.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_env_provider_requires_variables() {
        env::remove_var("IMAGESYNC_TEST_MISSING_USER");
        let provider = EnvProvider::new("IMAGESYNC_TEST_MISSING_USER", "IMAGESYNC_TEST_MISSING_PASS");
        assert!(provider.get_credentials("ghcr.io").await.is_err());

        env::set_var("IMAGESYNC_TEST_ENV_USER", "robot");
        env::set_var("IMAGESYNC_TEST_ENV_PASS", "secret");
        let provider = EnvProvider::new("IMAGESYNC_TEST_ENV_USER", "IMAGESYNC_TEST_ENV_PASS");
        let creds = provider.get_credentials("ghcr.io").await.unwrap().unwrap();
        assert_eq!(creds.username, "robot");
        assert_eq!(creds.password, "secret");
        env::remove_var("IMAGESYNC_TEST_ENV_USER");
        env::remove_var("IMAGESYNC_TEST_ENV_PASS");
    }

    #[tokio::test]
    async fn test_google_provider_prefers_env_token() {
        env::set_var("IMAGESYNC_TEST_GOOGLE_TOKEN", "ya29.token");
        let provider = GoogleProvider::new("IMAGESYNC_TEST_GOOGLE_TOKEN");
        let creds = provider.get_credentials("gcr.io").await.unwrap().unwrap();
        assert_eq!(creds.username, "oauth2accesstoken");
        assert_eq!(creds.password, "ya29.token");
        env::remove_var("IMAGESYNC_TEST_GOOGLE_TOKEN");
    }

    #[tokio::test]
    async fn test_chain_from_settings() {
        let chain = CredentialChain::from_settings(&crate::settings::Settings::default().credentials);
        // Only gcr hosts have a rule, everything else is anonymous
        assert!(chain.resolve("quay.io").await.unwrap().is_none());
    }
}
