use crate::models::{ClustersApcuStatuses, ClustersOpcacheStatuses};
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Source de vérité unique lue par la couche de présentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    pub selected_cluster: Option<String>,
    pub opcache: ClustersOpcacheStatuses,
    pub apcu: ClustersApcuStatuses,
    pub last_update: Option<OffsetDateTime>,
}

/// Événements appliqués au store. Chaque transition est une fonction totale
/// (état, événement) -> état ; jamais de mutation champ par champ.
#[derive(Debug, Clone)]
pub enum StateEvent {
    OpcacheFetched {
        tree: ClustersOpcacheStatuses,
        at: OffsetDateTime,
    },
    ApcuFetched {
        tree: ClustersApcuStatuses,
        at: OffsetDateTime,
    },
    ClusterSwitched(String),
}

/// Réducteur total. L'arbre est remplacé en bloc, pas de fusion partielle.
pub fn reduce(state: DashboardState, event: StateEvent) -> DashboardState {
    match event {
        StateEvent::OpcacheFetched { tree, at } => {
            // le cluster sélectionné par défaut est le premier de l'arbre,
            // uniquement si aucun n'est déjà sélectionné
            let selected_cluster = state
                .selected_cluster
                .or_else(|| tree.keys().next().cloned());
            DashboardState {
                selected_cluster,
                opcache: tree,
                apcu: state.apcu,
                last_update: Some(at),
            }
        }
        StateEvent::ApcuFetched { tree, at } => DashboardState {
            apcu: tree,
            last_update: Some(at),
            ..state
        },
        // aucune validation d'existence : un cluster absent dégrade en vues vides
        StateEvent::ClusterSwitched(name) => DashboardState {
            selected_cluster: Some(name),
            ..state
        },
    }
}

/// Poignée clonable sur l'état partagé. Écriture uniquement via `dispatch`,
/// le verrou couvre tout le swap donc aucune lecture déchirée possible.
#[derive(Clone, Default)]
pub struct Store {
    inner: Shared<DashboardState>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: new_state(DashboardState::default()),
        }
    }

    pub fn dispatch(&self, event: StateEvent) {
        let mut state = self.inner.lock();
        *state = reduce(state.clone(), event);
    }

    pub fn snapshot(&self) -> DashboardState {
        self.inner.lock().clone()
    }

    pub fn selected_cluster(&self) -> Option<String> {
        self.inner.lock().selected_cluster.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeOpcacheStatus;
    use std::collections::BTreeMap;

    fn tree_with_clusters(names: &[&str]) -> ClustersOpcacheStatuses {
        let mut tree = ClustersOpcacheStatuses::new();
        for name in names {
            let mut groups = BTreeMap::new();
            let mut hosts = BTreeMap::new();
            hosts.insert("h1".to_string(), NodeOpcacheStatus::default());
            groups.insert("g1".to_string(), hosts);
            tree.insert(name.to_string(), groups);
        }
        tree
    }

    #[test]
    fn opcache_fetch_defaults_selection_to_first_cluster() {
        let store = Store::new();
        store.dispatch(StateEvent::OpcacheFetched {
            tree: tree_with_clusters(&["prod", "staging"]),
            at: OffsetDateTime::now_utc(),
        });
        assert_eq!(store.selected_cluster(), Some("prod".to_string()));
    }

    #[test]
    fn opcache_fetch_keeps_existing_selection() {
        let store = Store::new();
        store.dispatch(StateEvent::ClusterSwitched("staging".to_string()));
        store.dispatch(StateEvent::OpcacheFetched {
            tree: tree_with_clusters(&["prod", "staging"]),
            at: OffsetDateTime::now_utc(),
        });
        assert_eq!(store.selected_cluster(), Some("staging".to_string()));
    }

    #[test]
    fn apcu_fetch_does_not_touch_selection() {
        let store = Store::new();
        store.dispatch(StateEvent::ApcuFetched {
            tree: ClustersApcuStatuses::new(),
            at: OffsetDateTime::now_utc(),
        });
        assert_eq!(store.selected_cluster(), None);
        assert!(store.snapshot().last_update.is_some());
    }

    #[test]
    fn switching_to_absent_cluster_is_allowed() {
        let store = Store::new();
        store.dispatch(StateEvent::OpcacheFetched {
            tree: tree_with_clusters(&["prod"]),
            at: OffsetDateTime::now_utc(),
        });
        store.dispatch(StateEvent::ClusterSwitched("missing".to_string()));

        let state = store.snapshot();
        assert_eq!(state.selected_cluster, Some("missing".to_string()));
        // aucune vue dérivée ne doit paniquer : le cluster absent est vide
        let groups: Vec<&String> = state
            .opcache
            .get("missing")
            .map(|g| g.keys().collect())
            .unwrap_or_default();
        assert!(groups.is_empty());
    }

    #[test]
    fn fetch_replaces_tree_wholesale() {
        let store = Store::new();
        store.dispatch(StateEvent::OpcacheFetched {
            tree: tree_with_clusters(&["prod", "staging"]),
            at: OffsetDateTime::now_utc(),
        });
        store.dispatch(StateEvent::OpcacheFetched {
            tree: tree_with_clusters(&["qa"]),
            at: OffsetDateTime::now_utc(),
        });
        let state = store.snapshot();
        assert_eq!(state.opcache.len(), 1);
        assert!(state.opcache.contains_key("qa"));
        // la sélection par défaut a été posée au premier fetch et reste
        assert_eq!(state.selected_cluster, Some("prod".to_string()));
    }
}
