use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// groupe -> hôte -> statut
pub type GroupTree<T> = BTreeMap<String, BTreeMap<String, T>>;
/// cluster -> groupe -> hôte -> statut
pub type ClusterTree<T> = BTreeMap<String, GroupTree<T>>;

pub type ClustersOpcacheStatuses = ClusterTree<NodeOpcacheStatus>;
pub type ClustersApcuStatuses = ClusterTree<NodeApcuStatus>;

/// Valeur scalaire d'une directive de configuration PHP.
///
/// Chaque build PHP expose son propre jeu de directives, donc la map reste
/// ouverte, mais chaque valeur est typée au lieu d'un `Value` dynamique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Statut OPcache d'un nœud unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeOpcacheStatus {
    pub php_version: String,
    pub configuration: BTreeMap<String, ConfigValue>,
    /// Bits actifs de opcache.optimization_level, décodés
    pub optimizations: Vec<u8>,
    pub start_time: i64,
    /// Si cache_full et num_cached_keys == max_cached_keys, il y a trop de
    /// fichiers : aucun restart ne sera déclenché et des scripts ne seront
    /// jamais mis en cache même s'il reste de la mémoire.
    pub cache_full: bool,
    pub memory: MemoryUsage,
    pub interned_strings: InternedStringsMemory,
    pub keys: Keys,
    pub key_hits: KeyHits,
    pub restarts: Restarts,
    /// None = hôte jamais échantillonné (différent d'une map vide)
    pub scripts: Option<BTreeMap<String, ScriptStatus>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryUsage {
    /// opcache.memory_consumption
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub wasted: u64,
    /// opcache.max_wasted_percentage
    pub max_wasted_percentage: f64,
    pub current_wasted_percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InternedStringsMemory {
    /// opcache.interned_strings_buffer, en octets
    pub total: u64,
    pub buffer_size: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub number_of_strings: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Keys {
    /// opcache.max_accelerated_files
    pub total: u64,
    /// status.opcache_statistics.max_cached_keys
    pub total_prime: u64,
    pub used_keys: u64,
    pub used_scripts: u64,
    /// total_prime - used_keys
    pub free: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyHits {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Restarts {
    pub out_of_memory_count: u64,
    pub hash_count: u64,
    pub manual_count: u64,
    pub last_restart_time: i64,
}

/// Statistiques d'un script compilé sur un nœud.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptStatus {
    pub hits: u64,
    pub create_timestamp: i64,
    pub last_used_timestamp: i64,
    pub memory: u64,
}

/// Statut APCu d'un nœud unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeApcuStatus {
    pub enabled: bool,
    pub sma_info: Option<ApcuSmaInfo>,
    pub settings: Option<BTreeMap<String, ApcuSetting>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApcuSmaInfo {
    pub num_seg: u64,
    pub seg_size: u64,
    pub avail_mem: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApcuSetting {
    pub global_value: String,
    pub local_value: String,
    pub access: u32,
}
