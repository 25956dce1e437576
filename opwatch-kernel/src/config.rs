use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 42042;
pub const DEFAULT_PULL_INTERVAL_SECONDS: u64 = 3600;
/// Budget d'attente avant re-collecte après un refresh déclenché.
/// Heuristique : le ré-échantillonnage distant n'émet aucun signal de fin.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 5000;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_pull_interval")]
    pub pull_interval_seconds: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub http: HttpConf,
    pub clusters: BTreeMap<String, ClusterConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConf {
    pub groups: BTreeMap<String, GroupConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GroupConf {
    /// URL de l'agent avec placeholder {host}, ex:
    /// "http://{host}:8080/agent.php"
    pub url_pattern: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.into(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

fn default_pull_interval() -> u64 {
    DEFAULT_PULL_INTERVAL_SECONDS
}

fn default_settle_delay() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

impl AppConfig {
    /// Adresse d'écoute HTTP, surchargée par OPWATCH_HTTP_ADDR si présent.
    pub fn http_addr(&self) -> String {
        std::env::var("OPWATCH_HTTP_ADDR")
            .unwrap_or_else(|_| format!("{}:{}", self.http.host, self.http.port))
    }
}

pub fn parse_config(yaml: &str) -> anyhow::Result<AppConfig> {
    let config: AppConfig = serde_yaml::from_str(yaml).context("can not parse yaml configuration")?;

    if config.clusters.is_empty() {
        bail!("cluster configuration not found in config");
    }

    for (cluster_name, cluster) in &config.clusters {
        for (group_name, group) in &cluster.groups {
            if !group.url_pattern.contains("{host}") {
                bail!(
                    "group {}/{}: url_pattern must contain a {{host}} placeholder",
                    cluster_name,
                    group_name
                );
            }
        }
    }

    Ok(config)
}

/// Lit la configuration YAML, chemin depuis OPWATCH_CONFIG (défaut: opwatch.yaml).
pub async fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("OPWATCH_CONFIG").unwrap_or_else(|_| "opwatch.yaml".into());
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("config file '{path}' not readable"))?;
    parse_config(&content)
}
