use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PASSTHROUGH_SENTINEL: &str = "!PASSTHRU";
pub const OAUTH_SENTINEL: &str = "!OAUTH";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
}

impl ApiFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(ApiFormat::OpenAi),
            "anthropic" => Some(ApiFormat::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAi => "openai",
            ApiFormat::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Passthrough,
    OAuth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::ApiKey => "api_key",
            AuthMode::Passthrough => "passthrough",
            AuthMode::OAuth => "oauth",
        }
    }
}

/// Immutable per-provider configuration, created at startup.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_format: ApiFormat,
    pub auth_mode: AuthMode,
    /// Ordered rotation keys; empty for passthrough/oauth providers.
    pub api_keys: Vec<String>,
    pub custom_headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub tool_name_sanitize: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub proxy_api_key: Option<String>,
    pub default_provider: String,
    pub request_timeout: Duration,
    pub streaming_connect_timeout: Duration,
    /// `None` means streams may be arbitrarily long-lived.
    pub streaming_read_timeout: Option<Duration>,
    pub max_retries: u32,
    pub log_request_metrics: bool,
    pub alias_max_chain_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
            proxy_api_key: None,
            default_provider: "openai".to_string(),
            request_timeout: Duration::from_secs(90),
            streaming_connect_timeout: Duration::from_secs(30),
            streaming_read_timeout: None,
            max_retries: 2,
            log_request_metrics: false,
            alias_max_chain_length: 10,
        }
    }
}

/// provider → alias (lowercased) → target.
pub type AliasTable = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub providers: Vec<ProviderConfig>,
    pub aliases: AliasTable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider '{0}': {1} cannot be combined with static keys")]
    MixedSentinel(String, &'static str),
    #[error("provider '{provider}': missing {variable}")]
    MissingVariable { provider: String, variable: String },
    #[error("invalid value for {variable}: {value}")]
    InvalidValue { variable: String, value: String },
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: String,
        source: toml::de::Error,
    },
}

/// Optional `vdm.toml` overlay; environment variables win on conflict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, FileProvider>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileProvider {
    #[serde(rename = "api-key")]
    pub api_key: Option<String>,
    #[serde(rename = "base-url")]
    pub base_url: Option<String>,
    #[serde(rename = "api-format")]
    pub api_format: Option<String>,
    #[serde(rename = "tool-name-sanitize", default)]
    pub tool_name_sanitize: bool,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Config {
    /// Load from the process environment plus an optional TOML file
    /// (`VDM_CONFIG_FILE`, falling back to `./vdm.toml` when present).
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let file = load_file_config(&env)?;
        Self::load(&env, file)
    }

    pub fn load(
        env: &BTreeMap<String, String>,
        file: Option<FileConfig>,
    ) -> Result<Self, ConfigError> {
        let settings = load_settings(env)?;
        let file = file.unwrap_or_default();

        let mut names: Vec<String> = Vec::new();
        for key in env.keys() {
            if let Some(prefix) = key.strip_suffix("_API_KEY")
                && key != "PROXY_API_KEY"
                && !prefix.is_empty()
            {
                names.push(prefix.to_lowercase());
            }
        }
        for name in file.providers.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names.dedup();

        let mut providers = Vec::new();
        let mut aliases: AliasTable = HashMap::new();
        for name in names {
            let file_provider = file.providers.get(&name);
            match load_provider(&name, env, file_provider, &settings)? {
                Some(provider) => providers.push(provider),
                None => continue,
            }
            let table = load_aliases(&name, env, file_provider);
            if !table.is_empty() {
                aliases.insert(name.clone(), table);
            }
        }

        Ok(Self {
            settings,
            providers,
            aliases,
        })
    }
}

fn load_file_config(env: &BTreeMap<String, String>) -> Result<Option<FileConfig>, ConfigError> {
    let path = match env.get("VDM_CONFIG_FILE") {
        Some(path) => path.clone(),
        None => {
            let default = "vdm.toml".to_string();
            if !std::path::Path::new(&default).exists() {
                return Ok(None);
            }
            default
        }
    };
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
        path: path.clone(),
        source,
    })?;
    let parsed = toml::from_str(&raw).map_err(|source| ConfigError::FileParse { path, source })?;
    Ok(Some(parsed))
}

fn load_settings(env: &BTreeMap<String, String>) -> Result<Settings, ConfigError> {
    let defaults = Settings::default();
    Ok(Settings {
        host: env.get("HOST").cloned().unwrap_or(defaults.host),
        port: parse_var(env, "PORT")?.unwrap_or(defaults.port),
        proxy_api_key: env.get("PROXY_API_KEY").cloned().filter(|v| !v.is_empty()),
        default_provider: env
            .get("VDM_DEFAULT_PROVIDER")
            .map(|value| value.to_lowercase())
            .unwrap_or(defaults.default_provider),
        request_timeout: parse_var::<u64>(env, "REQUEST_TIMEOUT")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout),
        streaming_connect_timeout: parse_var::<f64>(env, "STREAMING_CONNECT_TIMEOUT_SECONDS")?
            .map(seconds_to_duration)
            .unwrap_or(defaults.streaming_connect_timeout),
        streaming_read_timeout: parse_var::<f64>(env, "STREAMING_READ_TIMEOUT_SECONDS")?
            .map(seconds_to_duration),
        max_retries: parse_var(env, "MAX_RETRIES")?.unwrap_or(defaults.max_retries),
        log_request_metrics: parse_var(env, "LOG_REQUEST_METRICS")?
            .unwrap_or(defaults.log_request_metrics),
        alias_max_chain_length: parse_var(env, "ALIAS_MAX_CHAIN_LENGTH")?
            .unwrap_or(defaults.alias_max_chain_length),
    })
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn parse_var<T: std::str::FromStr>(
    env: &BTreeMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match env.get(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                variable: name.to_string(),
                value: value.clone(),
            }),
    }
}

fn load_provider(
    name: &str,
    env: &BTreeMap<String, String>,
    file: Option<&FileProvider>,
    settings: &Settings,
) -> Result<Option<ProviderConfig>, ConfigError> {
    let prefix = name.to_uppercase();

    let raw_key = env
        .get(&format!("{prefix}_API_KEY"))
        .cloned()
        .or_else(|| file.and_then(|f| f.api_key.clone()));
    let Some(raw_key) = raw_key else {
        return Ok(None);
    };

    let api_keys: Vec<String> = raw_key.split_whitespace().map(str::to_string).collect();
    if api_keys.is_empty() {
        return Ok(None);
    }
    for sentinel in [PASSTHROUGH_SENTINEL, OAUTH_SENTINEL] {
        if api_keys.len() > 1 && api_keys.iter().any(|key| key == sentinel) {
            return Err(ConfigError::MixedSentinel(
                name.to_string(),
                if sentinel == PASSTHROUGH_SENTINEL {
                    "'!PASSTHRU'"
                } else {
                    "'!OAUTH'"
                },
            ));
        }
    }

    let auth_mode = match api_keys[0].as_str() {
        PASSTHROUGH_SENTINEL => AuthMode::Passthrough,
        OAUTH_SENTINEL => AuthMode::OAuth,
        _ => AuthMode::ApiKey,
    };
    let api_keys = if auth_mode == AuthMode::ApiKey {
        api_keys
    } else {
        Vec::new()
    };

    let base_url = env
        .get(&format!("{prefix}_BASE_URL"))
        .cloned()
        .or_else(|| file.and_then(|f| f.base_url.clone()));
    let base_url = match base_url {
        Some(url) => url,
        None if name == "openai" => DEFAULT_OPENAI_BASE_URL.to_string(),
        None => {
            return Err(ConfigError::MissingVariable {
                provider: name.to_string(),
                variable: format!("{prefix}_BASE_URL"),
            });
        }
    };

    let api_format = env
        .get(&format!("{prefix}_API_FORMAT"))
        .cloned()
        .or_else(|| file.and_then(|f| f.api_format.clone()))
        .map(|value| {
            ApiFormat::parse(&value).ok_or(ConfigError::InvalidValue {
                variable: format!("{prefix}_API_FORMAT"),
                value,
            })
        })
        .transpose()?
        .unwrap_or(ApiFormat::OpenAi);

    Ok(Some(ProviderConfig {
        name: name.to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        api_format,
        auth_mode,
        api_keys,
        custom_headers: load_custom_headers(&prefix, env),
        timeout: settings.request_timeout,
        tool_name_sanitize: file.map(|f| f.tool_name_sanitize).unwrap_or(false),
    }))
}

/// `<PROVIDER>_CUSTOM_HEADER_<NAME>`; underscores in NAME become hyphens.
fn load_custom_headers(prefix: &str, env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let marker = format!("{prefix}_CUSTOM_HEADER_");
    let mut headers = Vec::new();
    for (key, value) in env {
        if let Some(name) = key.strip_prefix(&marker)
            && !name.is_empty()
        {
            headers.push((name.replace('_', "-"), value.clone()));
        }
    }
    headers
}

/// `<PROVIDER>_ALIAS_<NAME>` plus file aliases; env wins. Alias names are
/// stored lowercased.
fn load_aliases(
    name: &str,
    env: &BTreeMap<String, String>,
    file: Option<&FileProvider>,
) -> HashMap<String, String> {
    let mut table = HashMap::new();
    if let Some(file) = file {
        for (alias, target) in &file.aliases {
            table.insert(alias.to_lowercase(), target.clone());
        }
    }
    let marker = format!("{}_ALIAS_", name.to_uppercase());
    for (key, value) in env {
        if let Some(alias) = key.strip_prefix(&marker)
            && !alias.is_empty()
        {
            table.insert(alias.to_lowercase(), value.clone());
        }
    }
    table
}
