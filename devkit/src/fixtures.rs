/*!
Fixtures JSON des payloads d'agent de nœud

Payloads réalistes tels que produits par l'agent PHP
(configuration.directives + status), pour le parser du kernel et le stub.
*/

use serde_json::{json, Map, Value};

fn directives() -> Value {
    json!({
        "opcache.enable": true,
        "opcache.memory_consumption": 134217728u64,
        "opcache.interned_strings_buffer": 8,
        "opcache.max_accelerated_files": 10000,
        "opcache.max_wasted_percentage": 5.0,
        "opcache.optimization_level": 0x7FFEBFFFu64,
        "opcache.validate_timestamps": true,
        "opcache.revalidate_freq": "2"
    })
}

fn base_status() -> Value {
    json!({
        "cache_full": false,
        "opcache_statistics": {
            "start_time": 1700000000i64,
            "max_cached_keys": 16229,
            "num_cached_keys": 42,
            "num_cached_scripts": 40,
            "hits": 100000,
            "misses": 120,
            "oom_restarts": 0,
            "hash_restarts": 0,
            "manual_restarts": 1,
            "last_restart_time": 0
        },
        "memory_usage": {
            "used_memory": 41943040u64,
            "free_memory": 92274688u64,
            "wasted_memory": 0,
            "current_wasted_percentage": 0.0
        },
        "interned_strings_usage": {
            "buffer_size": 8388608u64,
            "used_memory": 1048576u64,
            "free_memory": 7340032u64,
            "number_of_strings": 21000
        }
    })
}

/// Message agent complet, avec les scripts donnés :
/// (chemin, hits, timestamp de compilation, last_used, memory_consumption).
pub fn agent_status_message(scripts: &[(&str, u64, i64, i64, u64)]) -> Value {
    let mut status = base_status();

    let mut scripts_map = Map::new();
    for (path, hits, timestamp, last_used, memory) in scripts {
        scripts_map.insert(
            path.to_string(),
            json!({
                "hits": hits,
                "timestamp": timestamp,
                "last_used_timestamp": last_used,
                "memory_consumption": memory
            }),
        );
    }
    status["scripts"] = Value::Object(scripts_map);

    json!({
        "configuration": {
            "directives": directives(),
            "version": { "version": "8.3.1", "opcache_product_name": "Zend OPcache" }
        },
        "status": status
    })
}

/// Message agent sans section scripts : nœud "non échantillonné".
pub fn agent_status_message_without_scripts() -> Value {
    json!({
        "configuration": {
            "directives": directives(),
            "version": { "version": "8.3.1", "opcache_product_name": "Zend OPcache" }
        },
        "status": base_status()
    })
}

/// Message agent avec un script et la section APCu.
pub fn agent_status_message_with_apcu() -> Value {
    let mut message = agent_status_message(&[("/var/www/index.php", 42, 100, 200, 4096)]);
    message["apcu"] = json!({
        "enabled": true,
        "sma_info": {
            "num_seg": 1,
            "seg_size": 33554432u64,
            "avail_mem": 25165824u64
        },
        "settings": {
            "apc.ttl": { "global_value": "7200", "local_value": "7200", "access": 4 },
            "apc.gc_ttl": { "global_value": "3600", "local_value": "3600", "access": 4 }
        }
    });
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_message_carries_scripts() {
        let message = agent_status_message(&[("/a.php", 1, 10, 20, 64)]);
        assert_eq!(message["status"]["scripts"]["/a.php"]["hits"], 1);
        assert_eq!(
            message["configuration"]["version"]["version"],
            "8.3.1"
        );
    }

    #[test]
    fn unsampled_message_has_no_scripts_key() {
        let message = agent_status_message_without_scripts();
        assert!(message["status"].get("scripts").is_none());
    }

    #[test]
    fn apcu_message_enables_apcu() {
        let message = agent_status_message_with_apcu();
        assert_eq!(message["apcu"]["enabled"], true);
    }
}
