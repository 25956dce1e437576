/**
 * OBSERVER - Collecte des statuts auprès des agents de nœud
 *
 * RÔLE : Tirer périodiquement le statut OPcache/APCu de chaque hôte configuré
 * (cluster > groupe > hôte) et maintenir les deux arbres de statuts.
 *
 * FONCTIONNEMENT :
 * - Arbres pré-remplis depuis la topologie : tout hôte configuré existe avec
 *   un statut "non échantillonné" avant le premier pull
 * - Un échec de pull sur un hôte est loggé et laisse l'entrée précédente
 *   intacte (stale-but-valid plutôt qu'écrasement partiel)
 * - Les snapshots remis au store sont des clones complets de l'arbre
 */
use crate::agent::AgentClient;
use crate::config::{ClusterConf, GroupConf};
use crate::error::ObserverError;
use crate::models::{ClustersApcuStatuses, ClustersOpcacheStatuses, NodeApcuStatus, NodeOpcacheStatus};
use crate::refresh::StatusBackend;
use crate::state::{new_state, Shared, StateEvent, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Observer {
    clusters: BTreeMap<String, ClusterConf>,
    agent: AgentClient,
    opcache: Shared<ClustersOpcacheStatuses>,
    apcu: Shared<ClustersApcuStatuses>,
    last_pull: Shared<Option<OffsetDateTime>>,
}

impl Observer {
    pub fn new(clusters: BTreeMap<String, ClusterConf>) -> Self {
        // structure initiale : chaque hôte configuré est présent, non échantillonné
        let mut opcache = ClustersOpcacheStatuses::new();
        let mut apcu = ClustersApcuStatuses::new();

        for (cluster_name, cluster) in &clusters {
            let opcache_cluster = opcache.entry(cluster_name.clone()).or_default();
            let apcu_cluster = apcu.entry(cluster_name.clone()).or_default();

            for (group_name, group) in &cluster.groups {
                let opcache_group = opcache_cluster.entry(group_name.clone()).or_default();
                let apcu_group = apcu_cluster.entry(group_name.clone()).or_default();

                for host in &group.hosts {
                    opcache_group.insert(host.clone(), NodeOpcacheStatus::default());
                    apcu_group.insert(host.clone(), NodeApcuStatus::default());
                }
            }
        }

        Self {
            clusters,
            agent: AgentClient::new(),
            opcache: new_state(opcache),
            apcu: new_state(apcu),
            last_pull: new_state(None),
        }
    }

    fn group_conf(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
    ) -> Result<&GroupConf, ObserverError> {
        let unknown = || ObserverError::UnknownNode {
            cluster: cluster.to_string(),
            group: group.to_string(),
            host: host.to_string(),
        };

        let group_conf = self
            .clusters
            .get(cluster)
            .and_then(|c| c.groups.get(group))
            .ok_or_else(unknown)?;

        if !group_conf.hosts.iter().any(|h| h == host) {
            return Err(unknown());
        }
        Ok(group_conf)
    }

    pub fn knows_node(&self, cluster: &str, group: &str, host: &str) -> bool {
        self.group_conf(cluster, group, host).is_ok()
    }

    /// Tire le statut de tous les agents configurés.
    pub async fn pull_agents(&self) {
        for (cluster_name, cluster) in &self.clusters {
            for (group_name, group) in &cluster.groups {
                for host in &group.hosts {
                    self.pull_host(cluster_name, group_name, host, group).await;
                }
            }
        }
    }

    async fn pull_host(&self, cluster: &str, group: &str, host: &str, conf: &GroupConf) {
        debug!(cluster, group, host, "observing node agent");

        match self
            .agent
            .fetch_status(&conf.url_pattern, host, conf.basic_auth.as_ref())
            .await
        {
            Ok(sample) => {
                self.opcache
                    .lock()
                    .entry(cluster.to_string())
                    .or_default()
                    .entry(group.to_string())
                    .or_default()
                    .insert(host.to_string(), sample.opcache);
                self.apcu
                    .lock()
                    .entry(cluster.to_string())
                    .or_default()
                    .entry(group.to_string())
                    .or_default()
                    .insert(host.to_string(), sample.apcu);
                *self.last_pull.lock() = Some(OffsetDateTime::now_utc());
            }
            Err(err) => {
                // l'entrée précédente reste en place
                warn!(cluster, group, host, %err, "node pull failed");
            }
        }
    }

    pub fn opcache_snapshot(&self) -> ClustersOpcacheStatuses {
        self.opcache.lock().clone()
    }

    pub fn apcu_snapshot(&self) -> ClustersApcuStatuses {
        self.apcu.lock().clone()
    }

    pub fn last_pull(&self) -> Option<OffsetDateTime> {
        *self.last_pull.lock()
    }

    /// Reset complet de l'OPcache d'un seul hôte.
    pub async fn reset_host(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
    ) -> Result<(), ObserverError> {
        let conf = self.group_conf(cluster, group, host)?;
        debug!(cluster, group, host, "resetting node opcache");
        self.agent
            .reset(&conf.url_pattern, host, conf.basic_auth.as_ref())
            .await
    }

    /// Invalidation d'un script compilé sur un seul hôte.
    pub async fn invalidate_script(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
        script: &str,
    ) -> Result<(), ObserverError> {
        let conf = self.group_conf(cluster, group, host)?;
        debug!(cluster, group, host, script, "invalidating script");
        self.agent
            .invalidate(&conf.url_pattern, host, conf.basic_auth.as_ref(), script)
            .await
    }
}

impl StatusBackend for Observer {
    /// Acquitté au lancement de la tâche, pas à la fin du ré-échantillonnage.
    async fn trigger_resample(&self) -> Result<(), ObserverError> {
        let observer = self.clone();
        tokio::task::spawn(async move {
            observer.pull_agents().await;
        });
        Ok(())
    }

    async fn collect_opcache(&self) -> Result<ClustersOpcacheStatuses, ObserverError> {
        Ok(self.opcache_snapshot())
    }

    async fn collect_apcu(&self) -> Result<ClustersApcuStatuses, ObserverError> {
        Ok(self.apcu_snapshot())
    }

    async fn reset_node(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
    ) -> Result<(), ObserverError> {
        self.reset_host(cluster, group, host).await
    }
}

/// Boucle de pull périodique : premier tick immédiat, puis toutes les
/// `every`. Chaque passe pousse les deux snapshots dans le store.
pub fn spawn_polling(observer: Arc<Observer>, store: Store, every: Duration) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            observer.pull_agents().await;
            let at = OffsetDateTime::now_utc();
            store.dispatch(StateEvent::OpcacheFetched {
                tree: observer.opcache_snapshot(),
                at,
            });
            store.dispatch(StateEvent::ApcuFetched {
                tree: observer.apcu_snapshot(),
                at,
            });
        }
    })
}
