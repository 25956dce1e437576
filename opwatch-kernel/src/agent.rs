/**
 * CLIENT AGENT - Dialogue HTTP avec l'agent de chaque nœud PHP
 *
 * RÔLE : Interroger l'agent (command=status/reset/invalidate), parser la
 * réponse JSON brute et la convertir en statut typé du modèle.
 *
 * CONTRAT : GET ?command=status[&scripts=1] -> {configuration, status[, apcu]}
 * 500 {error:"Opcache extension not loaded"} si l'extension est absente.
 * Les commandes reset/invalidate répondent {error:null} en cas de succès.
 */
use crate::config::BasicAuth;
use crate::error::ObserverError;
use crate::models::{
    ApcuSetting, ApcuSmaInfo, ConfigValue, InternedStringsMemory, KeyHits, Keys, MemoryUsage,
    NodeApcuStatus, NodeOpcacheStatus, Restarts, ScriptStatus,
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Statut complet d'un nœud tel que remonté par son agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSample {
    pub opcache: NodeOpcacheStatus,
    pub apcu: NodeApcuStatus,
}

// ---- forme brute du message agent (snake_case côté PHP) ----

#[derive(Debug, Deserialize)]
struct AgentMessage {
    configuration: AgentConfiguration,
    status: AgentStatus,
    #[serde(default)]
    apcu: Option<AgentApcu>,
}

#[derive(Debug, Deserialize)]
struct AgentConfiguration {
    #[serde(default)]
    directives: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    version: AgentVersion,
}

#[derive(Debug, Default, Deserialize)]
struct AgentVersion {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct AgentStatus {
    #[serde(default)]
    cache_full: bool,
    #[serde(default)]
    opcache_statistics: AgentOpcacheStatistics,
    #[serde(default)]
    memory_usage: AgentMemoryUsage,
    #[serde(default)]
    interned_strings_usage: AgentInternedStringsUsage,
    #[serde(default)]
    scripts: Option<BTreeMap<String, AgentScript>>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentOpcacheStatistics {
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    max_cached_keys: u64,
    #[serde(default)]
    num_cached_keys: u64,
    #[serde(default)]
    num_cached_scripts: u64,
    #[serde(default)]
    hits: u64,
    #[serde(default)]
    misses: u64,
    #[serde(default)]
    oom_restarts: u64,
    #[serde(default)]
    hash_restarts: u64,
    #[serde(default)]
    manual_restarts: u64,
    #[serde(default)]
    last_restart_time: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AgentMemoryUsage {
    #[serde(default)]
    used_memory: u64,
    #[serde(default)]
    free_memory: u64,
    #[serde(default)]
    wasted_memory: u64,
    #[serde(default)]
    current_wasted_percentage: f64,
}

#[derive(Debug, Default, Deserialize)]
struct AgentInternedStringsUsage {
    #[serde(default)]
    buffer_size: u64,
    #[serde(default)]
    used_memory: u64,
    #[serde(default)]
    free_memory: u64,
    #[serde(default)]
    number_of_strings: u64,
}

#[derive(Debug, Deserialize)]
struct AgentScript {
    #[serde(default)]
    hits: u64,
    /// nom historique côté opcache : "timestamp" = date de compilation
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    last_used_timestamp: i64,
    #[serde(default)]
    memory_consumption: u64,
}

#[derive(Debug, Deserialize)]
struct AgentApcu {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    sma_info: Option<AgentApcuSmaInfo>,
    #[serde(default)]
    settings: Option<BTreeMap<String, AgentApcuSetting>>,
}

#[derive(Debug, Deserialize)]
struct AgentApcuSmaInfo {
    #[serde(default)]
    num_seg: u64,
    #[serde(default)]
    seg_size: u64,
    #[serde(default)]
    avail_mem: u64,
}

#[derive(Debug, Deserialize)]
struct AgentApcuSetting {
    #[serde(default)]
    global_value: String,
    #[serde(default)]
    local_value: String,
    #[serde(default)]
    access: u32,
}

/// Acquittement des commandes reset / invalidate.
#[derive(Debug, Deserialize)]
pub struct AgentAck {
    pub error: Option<String>,
}

// ---- helpers directives ----

fn directive_u64(directives: &BTreeMap<String, serde_json::Value>, key: &str) -> u64 {
    match directives.get(key) {
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().map(|f| f as u64))
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0),
        None => 0,
    }
}

fn directive_f64(directives: &BTreeMap<String, serde_json::Value>, key: &str) -> f64 {
    match directives.get(key) {
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0.0),
        None => 0.0,
    }
}

fn to_config_value(value: &serde_json::Value) -> ConfigValue {
    match value {
        serde_json::Value::Bool(b) => ConfigValue::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => ConfigValue::Int(i),
            None => ConfigValue::Float(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => ConfigValue::Str(s.clone()),
        other => ConfigValue::Str(other.to_string()),
    }
}

/// Décode le bitmap opcache.optimization_level en liste de passes actives.
fn decode_optimizations(bitmap: u64) -> Vec<u8> {
    (0..=16u8).filter(|id| bitmap & (1u64 << id) != 0).collect()
}

/// Parse le message complet d'un agent en statut typé.
///
/// Un message sans section scripts est un nœud "non échantillonné"
/// (scripts: None), pas une erreur.
pub fn parse_agent_message(body: &[u8]) -> Result<NodeSample, ObserverError> {
    let message: AgentMessage = serde_json::from_slice(body)
        .map_err(|e| ObserverError::Agent(format!("can not parse agent response: {e}")))?;

    let directives = &message.configuration.directives;
    let stats = &message.status.opcache_statistics;

    let configuration: BTreeMap<String, ConfigValue> = directives
        .iter()
        .map(|(k, v)| (k.clone(), to_config_value(v)))
        .collect();

    let scripts = message.status.scripts.map(|scripts| {
        scripts
            .into_iter()
            .map(|(path, s)| {
                (
                    path,
                    ScriptStatus {
                        hits: s.hits,
                        create_timestamp: s.timestamp,
                        last_used_timestamp: s.last_used_timestamp,
                        memory: s.memory_consumption,
                    },
                )
            })
            .collect()
    });

    let opcache = NodeOpcacheStatus {
        php_version: message.configuration.version.version,
        optimizations: decode_optimizations(directive_u64(
            directives,
            "opcache.optimization_level",
        )),
        start_time: stats.start_time,
        cache_full: message.status.cache_full,
        memory: MemoryUsage {
            total: directive_u64(directives, "opcache.memory_consumption"),
            used: message.status.memory_usage.used_memory,
            free: message.status.memory_usage.free_memory,
            wasted: message.status.memory_usage.wasted_memory,
            max_wasted_percentage: directive_f64(directives, "opcache.max_wasted_percentage"),
            current_wasted_percentage: message.status.memory_usage.current_wasted_percentage,
        },
        interned_strings: InternedStringsMemory {
            // directive en MB
            total: directive_u64(directives, "opcache.interned_strings_buffer") * 1024 * 1024,
            buffer_size: message.status.interned_strings_usage.buffer_size,
            used_memory: message.status.interned_strings_usage.used_memory,
            free_memory: message.status.interned_strings_usage.free_memory,
            number_of_strings: message.status.interned_strings_usage.number_of_strings,
        },
        keys: Keys {
            total: directive_u64(directives, "opcache.max_accelerated_files"),
            total_prime: stats.max_cached_keys,
            used_keys: stats.num_cached_keys,
            used_scripts: stats.num_cached_scripts,
            free: stats.max_cached_keys.saturating_sub(stats.num_cached_keys),
        },
        key_hits: KeyHits {
            hits: stats.hits,
            misses: stats.misses,
        },
        restarts: Restarts {
            out_of_memory_count: stats.oom_restarts,
            hash_count: stats.hash_restarts,
            manual_count: stats.manual_restarts,
            last_restart_time: stats.last_restart_time,
        },
        configuration,
        scripts,
    };

    let apcu = match message.apcu {
        Some(apcu) => NodeApcuStatus {
            enabled: apcu.enabled,
            sma_info: apcu.sma_info.map(|s| ApcuSmaInfo {
                num_seg: s.num_seg,
                seg_size: s.seg_size,
                avail_mem: s.avail_mem,
            }),
            settings: apcu.settings.map(|settings| {
                settings
                    .into_iter()
                    .map(|(k, s)| {
                        (
                            k,
                            ApcuSetting {
                                global_value: s.global_value,
                                local_value: s.local_value,
                                access: s.access,
                            },
                        )
                    })
                    .collect()
            }),
        },
        None => NodeApcuStatus::default(),
    };

    Ok(NodeSample { opcache, apcu })
}

/// Client HTTP vers les agents de nœud.
#[derive(Debug, Clone, Default)]
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Substitue {host} dans le pattern d'URL du groupe.
    pub fn agent_url(url_pattern: &str, host: &str) -> String {
        url_pattern.replace("{host}", host)
    }

    async fn get(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<(reqwest::StatusCode, Vec<u8>), ObserverError> {
        let mut request = self.http.get(url);
        if let Some(auth) = auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok((status, body))
    }

    /// Erreur JSON de l'agent si le corps en contient une.
    fn agent_reported_error(body: &[u8]) -> Option<String> {
        serde_json::from_slice::<AgentAck>(body)
            .ok()
            .and_then(|ack| ack.error)
    }

    pub async fn fetch_status(
        &self,
        url_pattern: &str,
        host: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<NodeSample, ObserverError> {
        let url = format!(
            "{}?command=status&scripts=1",
            Self::agent_url(url_pattern, host)
        );
        let (status, body) = self.get(&url, auth).await?;

        if !status.is_success() {
            return Err(match Self::agent_reported_error(&body) {
                Some(message) => ObserverError::Agent(message),
                None => ObserverError::Transport(format!("node agent returned {status}")),
            });
        }

        parse_agent_message(&body)
    }

    /// Commande simple (reset / invalidate) : succès = {error: null}.
    async fn command(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<(), ObserverError> {
        let (status, body) = self.get(url, auth).await?;

        if let Some(message) = Self::agent_reported_error(&body) {
            return Err(ObserverError::Agent(message));
        }
        if !status.is_success() {
            return Err(ObserverError::Transport(format!(
                "node agent returned {status}"
            )));
        }
        Ok(())
    }

    pub async fn reset(
        &self,
        url_pattern: &str,
        host: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<(), ObserverError> {
        let url = format!("{}?command=reset", Self::agent_url(url_pattern, host));
        self.command(&url, auth).await
    }

    pub async fn invalidate(
        &self,
        url_pattern: &str,
        host: &str,
        auth: Option<&BasicAuth>,
        script: &str,
    ) -> Result<(), ObserverError> {
        let url = format!(
            "{}?command=invalidate&script={}",
            Self::agent_url(url_pattern, host),
            script
        );
        self.command(&url, auth).await
    }
}
