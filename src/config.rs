use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub integrations: BTreeMap<String, IntegrationConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("montaine/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    #[default]
    Log,
    Outbox,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub mode: AlertMode,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
    Basic,
    Header,
    Query,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Header name (`header`) or query parameter name (`query`).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Environment variable holding the secret. Wins over `credential`.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Date,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntegrationConfig {
    /// Key of the `[integrations.<name>]` table, filled in at load.
    #[serde(skip)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub result_path: Option<String>,
    #[serde(default)]
    pub mapping_schema: Option<String>,
    #[serde(default)]
    pub mapping_schema_file: Option<PathBuf>,
    #[serde(default)]
    pub typing_schema: Option<String>,
    #[serde(default)]
    pub typing_schema_file: Option<PathBuf>,
    #[serde(default)]
    pub auto_pipeline: Option<String>,
    #[serde(default)]
    pub auto_pipeline_file: Option<PathBuf>,
    #[serde(default)]
    pub save: bool,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub alert_email: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl IntegrationConfig {
    /// Target collection; defaults to the integration name.
    pub fn collection(&self) -> &str {
        self.collection.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    pub fn integration(&self, name: &str) -> Result<&IntegrationConfig> {
        match self.integrations.get(name) {
            Some(integration) => Ok(integration),
            None => {
                let available: Vec<&str> = self.integrations.keys().map(String::as_str).collect();
                bail!(
                    "Unknown integration: '{}'. Available: {}",
                    name,
                    if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    }
                )
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&content, base_dir)
}

/// Parse and validate a config document. `*_file` paths resolve against
/// `base_dir`.
pub fn parse_config(content: &str, base_dir: &Path) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.fetch.timeout_secs == 0 {
        bail!("fetch.timeout_secs must be > 0");
    }

    for (name, integration) in config.integrations.iter_mut() {
        integration.name = name.clone();
        resolve_integration(integration, base_dir)
            .with_context(|| format!("Invalid integration '{}'", name))?;
    }

    Ok(config)
}

fn resolve_integration(integration: &mut IntegrationConfig, base_dir: &Path) -> Result<()> {
    if !(integration.url.starts_with("http://") || integration.url.starts_with("https://")) {
        bail!("url must be http(s), got '{}'", integration.url);
    }

    match integration.auth.mode {
        AuthMode::Header | AuthMode::Query if integration.auth.name.is_none() => {
            bail!("auth.name is required for auth mode {:?}", integration.auth.mode)
        }
        AuthMode::Basic if integration.auth.username.is_none() => {
            bail!("auth.username is required for basic auth")
        }
        _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &integration.parameters {
        if !seen.insert(spec.name.as_str()) {
            bail!("parameter '{}' is declared twice", spec.name);
        }
    }

    resolve_json(
        "mapping_schema",
        &mut integration.mapping_schema,
        &integration.mapping_schema_file,
        base_dir,
    )?;
    resolve_json(
        "typing_schema",
        &mut integration.typing_schema,
        &integration.typing_schema_file,
        base_dir,
    )?;
    resolve_json(
        "auto_pipeline",
        &mut integration.auto_pipeline,
        &integration.auto_pipeline_file,
        base_dir,
    )?;
    Ok(())
}

/// Load `field` from `file` when given, then check it is valid JSON.
fn resolve_json(
    label: &str,
    inline: &mut Option<String>,
    file: &Option<PathBuf>,
    base_dir: &Path,
) -> Result<()> {
    if let Some(file) = file {
        if inline.is_some() {
            bail!("{} and {}_file are mutually exclusive", label, label);
        }
        let path = base_dir.join(file);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}_file: {}", label, path.display()))?;
        *inline = Some(content);
    }
    if let Some(json) = inline.as_deref() {
        serde_json::from_str::<Value>(json)
            .with_context(|| format!("{} is not valid JSON", label))?;
    }
    Ok(())
}
