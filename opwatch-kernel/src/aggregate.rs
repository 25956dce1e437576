/**
 * MOTEUR D'AGRÉGATION - Fusion des statuts par cluster / groupe / script
 *
 * RÔLE : Transformations pures (aucune I/O) de la tranche d'arbre d'un
 * cluster vers les vues dérivées : rollup par script, alertes par hôte,
 * projections de configuration et view-models de graphiques.
 *
 * RÈGLES DE FUSION (rollup scripts) :
 * - clé de fusion = chemin du script (pas le couple hôte/script)
 * - create_timestamp = min, last_used_timestamp = max, hits = somme
 * - memory = valeur du premier hôte rencontré (approximation assumée :
 *   la mémoire n'est pas additive entre hôtes dans la donnée source)
 * - hôte sans scripts (None ou vide) = ignoré, ne touche pas l'existant
 *
 * Tout est recalculé depuis le dernier snapshot, jamais persisté ni muté.
 */
use crate::models::{
    ApcuSetting, ConfigValue, GroupTree, NodeApcuStatus, NodeOpcacheStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Statistiques d'un script fusionnées sur un ensemble d'hôtes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScriptAggregate {
    pub script: String,
    pub create_timestamp: i64,
    pub last_used_timestamp: i64,
    pub hits: u64,
    pub memory: u64,
}

/// Rollup d'un cluster : portée globale et portée par groupe.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScriptRollup {
    pub all: BTreeMap<String, ScriptAggregate>,
    pub per_group: BTreeMap<String, BTreeMap<String, ScriptAggregate>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
}

/// Replie les scripts d'un hôte dans la map cible.
fn fold_host_scripts(target: &mut BTreeMap<String, ScriptAggregate>, status: &NodeOpcacheStatus) {
    let scripts = match &status.scripts {
        Some(scripts) if !scripts.is_empty() => scripts,
        // non échantillonné ou vide : saut idempotent
        _ => return,
    };

    for (path, script) in scripts {
        match target.get_mut(path) {
            Some(existing) => {
                existing.create_timestamp =
                    existing.create_timestamp.min(script.create_timestamp);
                existing.last_used_timestamp =
                    existing.last_used_timestamp.max(script.last_used_timestamp);
                existing.hits += script.hits;
                // memory volontairement non cumulée
            }
            None => {
                target.insert(
                    path.clone(),
                    ScriptAggregate {
                        script: path.clone(),
                        create_timestamp: script.create_timestamp,
                        last_used_timestamp: script.last_used_timestamp,
                        hits: script.hits,
                        memory: script.memory,
                    },
                );
            }
        }
    }
}

/// Rollup par script d'une tranche cluster, portées `all` et `per_group`.
/// Un cluster sans groupe produit des maps vides.
pub fn script_rollup(cluster: &GroupTree<NodeOpcacheStatus>) -> ScriptRollup {
    let mut rollup = ScriptRollup::default();

    for (group_name, hosts) in cluster {
        let group_target = rollup.per_group.entry(group_name.clone()).or_default();
        for status in hosts.values() {
            fold_host_scripts(&mut rollup.all, status);
            fold_host_scripts(group_target, status);
        }
    }

    rollup
}

/// Alertes dérivées d'un seul nœud. Jeu de règles fixe et déterministe.
pub fn node_alerts(status: &NodeOpcacheStatus) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if status.cache_full {
        alerts.push(Alert {
            severity: AlertSeverity::Error,
            message: "Cache is full, increase \"opcache.memory_consumption\" or decrease \"opcache.max_wasted_percentage\".".to_string(),
        });
    }

    alerts
}

/// Alertes de tout un cluster, toujours portées par (groupe, hôte).
pub fn cluster_alerts(
    cluster: &GroupTree<NodeOpcacheStatus>,
) -> BTreeMap<String, BTreeMap<String, Vec<Alert>>> {
    cluster
        .iter()
        .map(|(group, hosts)| {
            (
                group.clone(),
                hosts
                    .iter()
                    .map(|(host, status)| (host.clone(), node_alerts(status)))
                    .collect(),
            )
        })
        .collect()
}

/// Projection groupe -> hôte -> configuration, sans fusion inter-hôtes :
/// chaque build PHP a son propre jeu de directives.
pub fn configuration_view(
    cluster: &GroupTree<NodeOpcacheStatus>,
) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, ConfigValue>>> {
    cluster
        .iter()
        .map(|(group, hosts)| {
            (
                group.clone(),
                hosts
                    .iter()
                    .map(|(host, status)| (host.clone(), status.configuration.clone()))
                    .collect(),
            )
        })
        .collect()
}

/// Projection groupe -> hôte -> settings APCu. Hôte non échantillonné = map vide.
pub fn apcu_settings_view(
    cluster: &GroupTree<NodeApcuStatus>,
) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, ApcuSetting>>> {
    cluster
        .iter()
        .map(|(group, hosts)| {
            (
                group.clone(),
                hosts
                    .iter()
                    .map(|(host, status)| {
                        (host.clone(), status.settings.clone().unwrap_or_default())
                    })
                    .collect(),
            )
        })
        .collect()
}

// ---- view-models de graphiques (un seul nœud, jamais fusionnés) ----

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryChart {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub wasted: u64,
    pub used_percent: f64,
    pub free_percent: f64,
    pub wasted_percent: f64,
    pub used_human: String,
    pub free_human: String,
    pub wasted_human: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KeysChart {
    pub total_prime: u64,
    pub used_keys: u64,
    pub used_scripts: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HitRateChart {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InternedStringsChart {
    pub buffer_size: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub number_of_strings: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeCharts {
    pub memory: MemoryChart,
    pub keys: KeysChart,
    pub key_hits: HitRateChart,
    pub interned_strings: InternedStringsChart,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApcuSmaChart {
    pub seg_size: u64,
    pub avail_mem: u64,
    pub used_mem: u64,
    pub used_percent: f64,
    pub seg_size_human: String,
    pub avail_mem_human: String,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Format lisible en base 1024, une décimale.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn node_charts(status: &NodeOpcacheStatus) -> NodeCharts {
    let allocated = status.memory.used + status.memory.free + status.memory.wasted;
    NodeCharts {
        memory: MemoryChart {
            total: status.memory.total,
            used: status.memory.used,
            free: status.memory.free,
            wasted: status.memory.wasted,
            used_percent: percent(status.memory.used, allocated),
            free_percent: percent(status.memory.free, allocated),
            wasted_percent: percent(status.memory.wasted, allocated),
            used_human: format_bytes(status.memory.used),
            free_human: format_bytes(status.memory.free),
            wasted_human: format_bytes(status.memory.wasted),
        },
        keys: KeysChart {
            total_prime: status.keys.total_prime,
            used_keys: status.keys.used_keys,
            used_scripts: status.keys.used_scripts,
            free: status.keys.free,
            used_percent: percent(status.keys.used_keys, status.keys.total_prime),
        },
        key_hits: HitRateChart {
            hits: status.key_hits.hits,
            misses: status.key_hits.misses,
            hit_rate_percent: percent(
                status.key_hits.hits,
                status.key_hits.hits + status.key_hits.misses,
            ),
        },
        interned_strings: InternedStringsChart {
            buffer_size: status.interned_strings.buffer_size,
            used_memory: status.interned_strings.used_memory,
            free_memory: status.interned_strings.free_memory,
            number_of_strings: status.interned_strings.number_of_strings,
            used_percent: percent(
                status.interned_strings.used_memory,
                status.interned_strings.used_memory + status.interned_strings.free_memory,
            ),
        },
    }
}

/// Graphique SMA d'un nœud APCu ; None si le nœud n'a pas remonté de SMA.
pub fn apcu_sma_chart(status: &NodeApcuStatus) -> Option<ApcuSmaChart> {
    let sma = status.sma_info.as_ref()?;
    let total = sma.num_seg.max(1) * sma.seg_size;
    let used = total.saturating_sub(sma.avail_mem);
    Some(ApcuSmaChart {
        seg_size: sma.seg_size,
        avail_mem: sma.avail_mem,
        used_mem: used,
        used_percent: percent(used, total),
        seg_size_human: format_bytes(sma.seg_size),
        avail_mem_human: format_bytes(sma.avail_mem),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScriptStatus;

    fn host_with_scripts(scripts: &[(&str, u64, i64, i64, u64)]) -> NodeOpcacheStatus {
        NodeOpcacheStatus {
            scripts: Some(
                scripts
                    .iter()
                    .map(|(path, hits, create, last_used, memory)| {
                        (
                            path.to_string(),
                            ScriptStatus {
                                hits: *hits,
                                create_timestamp: *create,
                                last_used_timestamp: *last_used,
                                memory: *memory,
                            },
                        )
                    })
                    .collect(),
            ),
            ..NodeOpcacheStatus::default()
        }
    }

    fn cluster(groups: Vec<(&str, Vec<(&str, NodeOpcacheStatus)>)>) -> GroupTree<NodeOpcacheStatus> {
        groups
            .into_iter()
            .map(|(group, hosts)| {
                (
                    group.to_string(),
                    hosts
                        .into_iter()
                        .map(|(host, status)| (host.to_string(), status))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn empty_cluster_yields_empty_rollup() {
        let rollup = script_rollup(&GroupTree::new());
        assert!(rollup.all.is_empty());
        assert!(rollup.per_group.is_empty());
    }

    #[test]
    fn two_hosts_sharing_a_script_merge_per_spec_scenario() {
        // hostA: hits=5 create=100 lastUsed=200 memory=10
        // hostB: hits=3 create=90  lastUsed=250 memory=12
        let tree = cluster(vec![(
            "g1",
            vec![
                ("hostA", host_with_scripts(&[("/a.php", 5, 100, 200, 10)])),
                ("hostB", host_with_scripts(&[("/a.php", 3, 90, 250, 12)])),
            ],
        )]);

        let rollup = script_rollup(&tree);
        let agg = &rollup.all["/a.php"];
        assert_eq!(agg.hits, 8);
        assert_eq!(agg.create_timestamp, 90);
        assert_eq!(agg.last_used_timestamp, 250);
        // memory du premier hôte rencontré
        assert_eq!(agg.memory, 10);
    }

    #[test]
    fn hits_accumulation_is_order_independent() {
        let a = host_with_scripts(&[("/a.php", 5, 100, 200, 10)]);
        let b = host_with_scripts(&[("/a.php", 3, 90, 250, 12)]);

        let mut forward = BTreeMap::new();
        fold_host_scripts(&mut forward, &a);
        fold_host_scripts(&mut forward, &b);

        let mut reverse = BTreeMap::new();
        fold_host_scripts(&mut reverse, &b);
        fold_host_scripts(&mut reverse, &a);

        assert_eq!(forward["/a.php"].hits, reverse["/a.php"].hits);
        assert_eq!(
            forward["/a.php"].create_timestamp,
            reverse["/a.php"].create_timestamp
        );
        assert_eq!(
            forward["/a.php"].last_used_timestamp,
            reverse["/a.php"].last_used_timestamp
        );
        // seule la mémoire dépend de l'ordre, par construction
        assert_eq!(forward["/a.php"].memory, 10);
        assert_eq!(reverse["/a.php"].memory, 12);
    }

    #[test]
    fn unsampled_hosts_are_skipped_and_do_not_reset_existing_entries() {
        let sampled = host_with_scripts(&[("/a.php", 5, 100, 200, 10)]);
        let never_sampled = NodeOpcacheStatus::default(); // scripts: None
        let empty_sample = NodeOpcacheStatus {
            scripts: Some(BTreeMap::new()),
            ..NodeOpcacheStatus::default()
        };

        let tree = cluster(vec![(
            "g1",
            vec![
                ("h1", sampled),
                ("h2", never_sampled),
                ("h3", empty_sample),
            ],
        )]);

        let rollup = script_rollup(&tree);
        assert_eq!(rollup.all.len(), 1);
        assert_eq!(rollup.all["/a.php"].hits, 5);
    }

    #[test]
    fn per_group_scope_only_covers_own_hosts() {
        let tree = cluster(vec![
            (
                "g1",
                vec![("h1", host_with_scripts(&[("/a.php", 5, 100, 200, 10)]))],
            ),
            (
                "g2",
                vec![("h2", host_with_scripts(&[("/a.php", 3, 90, 250, 12)]))],
            ),
        ]);

        let rollup = script_rollup(&tree);
        assert_eq!(rollup.all["/a.php"].hits, 8);
        assert_eq!(rollup.per_group["g1"]["/a.php"].hits, 5);
        assert_eq!(rollup.per_group["g2"]["/a.php"].hits, 3);
    }

    #[test]
    fn cache_full_yields_exactly_one_error_alert() {
        let full = NodeOpcacheStatus {
            cache_full: true,
            ..NodeOpcacheStatus::default()
        };
        let alerts = node_alerts(&full);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Error);

        let ok = NodeOpcacheStatus::default();
        assert!(node_alerts(&ok).is_empty());
    }

    #[test]
    fn cluster_alerts_stay_host_scoped() {
        let full = NodeOpcacheStatus {
            cache_full: true,
            ..NodeOpcacheStatus::default()
        };
        let tree = cluster(vec![(
            "g1",
            vec![("h1", full), ("h2", NodeOpcacheStatus::default())],
        )]);

        let alerts = cluster_alerts(&tree);
        assert_eq!(alerts["g1"]["h1"].len(), 1);
        assert!(alerts["g1"]["h2"].is_empty());
    }

    #[test]
    fn chart_percentages_survive_zero_denominators() {
        let charts = node_charts(&NodeOpcacheStatus::default());
        assert_eq!(charts.memory.used_percent, 0.0);
        assert_eq!(charts.keys.used_percent, 0.0);
        assert_eq!(charts.key_hits.hit_rate_percent, 0.0);
    }

    #[test]
    fn formats_bytes_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(134_217_728), "128.0 MB");
    }

    #[test]
    fn apcu_chart_absent_without_sma_info() {
        assert!(apcu_sma_chart(&NodeApcuStatus::default()).is_none());

        let status = NodeApcuStatus {
            enabled: true,
            sma_info: Some(crate::models::ApcuSmaInfo {
                num_seg: 1,
                seg_size: 1024,
                avail_mem: 256,
            }),
            settings: None,
        };
        let chart = apcu_sma_chart(&status).unwrap();
        assert_eq!(chart.used_mem, 768);
        assert_eq!(chart.used_percent, 75.0);
    }
}
