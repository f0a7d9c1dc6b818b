use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when `--config` is not given
pub const CONFIG_PATH_ENV: &str = "IMAGESYNC_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub sync: SyncSettings,
    /// Ordered credential rules, first match wins. Hosts without a rule are accessed anonymously.
    #[serde(default = "default_credentials")]
    pub credentials: Vec<CredentialRuleSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings::default(),
            sync: SyncSettings::default(),
            credentials: default_credentials(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    /// Registries spoken to over plain HTTP (e.g. "localhost:5000")
    #[serde(default)]
    pub insecure_hosts: Vec<String>,

    /// Deadline for a single registry call in seconds (default: 300)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent sent with manifest deletions
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Page size used when listing tags (default: 1000)
    #[serde(default = "default_tag_page_size")]
    pub tag_page_size: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            insecure_hosts: Vec::new(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            tag_page_size: default_tag_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncSettings {
    /// Reject sources that are not pinned by digest
    #[serde(default)]
    pub require_pinned_source: bool,
}

/// A credential rule: which hosts it applies to and where credentials come from.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CredentialRuleSettings {
    /// Exact hostnames or `*.suffix` wildcards, ports included where relevant
    pub hosts: Vec<String>,
    #[serde(flatten)]
    pub source: CredentialSource,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// Read username and password from the named environment variables at call time
    Env {
        username_var: String,
        password_var: String,
    },
    /// OAuth2 access token from `token_var`, falling back to `gcloud auth print-access-token`
    Google {
        #[serde(default = "default_google_token_var")]
        token_var: String,
    },
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("imagesync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_tag_page_size() -> usize {
    1000
}

fn default_google_token_var() -> String {
    "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()
}

fn default_credentials() -> Vec<CredentialRuleSettings> {
    vec![CredentialRuleSettings {
        hosts: ["gcr.io", "eu.gcr.io", "us.gcr.io", "asia.gcr.io"]
            .iter()
            .map(|h| h.to_string())
            .collect(),
        source: CredentialSource::Google {
            token_var: default_google_token_var(),
        },
    }]
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        lazy_static::lazy_static! {
            static ref VAR_RE: regex::Regex =
                regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
        }

        VAR_RE
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Config file to load: the explicit path, else `$IMAGESYNC_CONFIG`, else none
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
    }

    /// Load settings from an optional TOML/YAML file layered under `IMAGESYNC_*`
    /// environment variables (`IMAGESYNC_REGISTRY__TIMEOUT_SECS=60`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Message(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            tracing::info!("Loading config file: {}", path.display());
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("IMAGESYNC")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("registry.insecure_hosts"),
        );

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        if settings.registry.tag_page_size == 0 {
            return Err(ConfigError::Message(
                "registry.tag_page_size must be greater than zero".to_string(),
            ));
        }

        Ok(settings)
    }
}
