/**
 * COORDINATEUR DE REFRESH - Protocole "déclencher, attendre, re-collecter"
 *
 * RÔLE : Orchestrer un cycle de rafraîchissement à l'échelle du cluster :
 * demander aux nœuds de ré-échantillonner (fire-and-forget), patienter le
 * budget de stabilisation (aucun signal de fin n'existe côté distant), puis
 * re-collecter les deux arbres et les pousser dans le store.
 *
 * MACHINE À ÉTATS par cycle : Idle -> Triggered -> Waiting -> Collected -> Idle
 *
 * Un refresh demandé pendant un cycle en vol est coalescé : l'appelant
 * attend l'issue du cycle existant, aucun second timer n'est démarré.
 * Un échec (trigger ou collecte) rend l'erreur à l'appelant et laisse le
 * store strictement inchangé.
 */
use crate::error::ObserverError;
use crate::models::{ClustersApcuStatuses, ClustersOpcacheStatuses};
use crate::state::{new_state, Shared, StateEvent, Store};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Interface de collecte vers le magasin de statuts.
///
/// Les échecs de transport doivent être des erreurs distinguables, jamais
/// des arbres vides substitués.
pub trait StatusBackend: Send + Sync + 'static {
    /// Demande un ré-échantillonnage de tous les nœuds. Acquitté au
    /// déclenchement, pas à la fin de l'échantillonnage distant.
    fn trigger_resample(&self) -> impl Future<Output = Result<(), ObserverError>> + Send;

    fn collect_opcache(
        &self,
    ) -> impl Future<Output = Result<ClustersOpcacheStatuses, ObserverError>> + Send;

    fn collect_apcu(
        &self,
    ) -> impl Future<Output = Result<ClustersApcuStatuses, ObserverError>> + Send;

    /// Reset du cache d'un seul hôte.
    fn reset_node(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
    ) -> impl Future<Output = Result<(), ObserverError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Triggered,
    Waiting,
    Collected,
}

#[derive(Debug)]
struct Cycle {
    phase: RefreshPhase,
    seq: u64,
}

/// Issue diffusée aux appelants coalescés.
#[derive(Debug, Clone)]
struct CycleOutcome {
    seq: u64,
    result: Result<(), ObserverError>,
}

pub struct RefreshCoordinator<B> {
    backend: Arc<B>,
    store: Store,
    settle_delay: Duration,
    cycle: Shared<Cycle>,
    done_tx: watch::Sender<CycleOutcome>,
}

impl<B: StatusBackend> RefreshCoordinator<B> {
    pub fn new(backend: Arc<B>, store: Store, settle_delay: Duration) -> Self {
        let (done_tx, _) = watch::channel(CycleOutcome {
            seq: 0,
            result: Ok(()),
        });
        Self {
            backend,
            store,
            settle_delay,
            cycle: new_state(Cycle {
                phase: RefreshPhase::Idle,
                seq: 0,
            }),
            done_tx,
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.cycle.lock().phase
    }

    fn set_phase(&self, phase: RefreshPhase) {
        self.cycle.lock().phase = phase;
    }

    /// Refresh à l'échelle du cluster. Coalesce si un cycle est déjà en vol.
    pub async fn refresh_cluster(&self) -> Result<(), ObserverError> {
        // le guard doit sortir de portée lexicale avant tout await pour que
        // le futur reste Send
        let claimed = {
            let mut cycle = self.cycle.lock();
            if cycle.phase != RefreshPhase::Idle {
                Err(cycle.seq)
            } else {
                cycle.seq += 1;
                cycle.phase = RefreshPhase::Triggered;
                Ok(cycle.seq)
            }
        };
        let seq = match claimed {
            Err(in_flight) => {
                debug!(seq = in_flight, "refresh coalesced into in-flight cycle");
                return self.await_cycle(in_flight).await;
            }
            Ok(seq) => seq,
        };

        debug!(seq, "refresh cycle triggered");
        let result = self.run_cycle().await;
        if let Err(err) = &result {
            warn!(seq, %err, "refresh cycle failed, keeping previous state");
        }

        self.set_phase(RefreshPhase::Idle);
        self.done_tx.send_replace(CycleOutcome {
            seq,
            result: result.clone(),
        });
        result
    }

    async fn run_cycle(&self) -> Result<(), ObserverError> {
        self.backend.trigger_resample().await?;

        self.set_phase(RefreshPhase::Waiting);
        tokio::time::sleep(self.settle_delay).await;

        self.set_phase(RefreshPhase::Collected);
        // les deux arbres sont collectés avant tout dispatch : un échec
        // laisse le store bit à bit identique
        let opcache = self.backend.collect_opcache().await?;
        let apcu = self.backend.collect_apcu().await?;

        let at = OffsetDateTime::now_utc();
        self.store.dispatch(StateEvent::OpcacheFetched { tree: opcache, at });
        self.store.dispatch(StateEvent::ApcuFetched { tree: apcu, at });
        Ok(())
    }

    async fn await_cycle(&self, seq: u64) -> Result<(), ObserverError> {
        let mut rx = self.done_tx.subscribe();
        loop {
            {
                let outcome = rx.borrow_and_update();
                if outcome.seq >= seq {
                    return outcome.result.clone();
                }
            }
            if rx.changed().await.is_err() {
                return Err(ObserverError::Transport("refresh cycle aborted".into()));
            }
        }
    }

    /// Reset d'un seul nœud puis refresh complet du cluster : l'agent ne
    /// renvoie pas de statistiques à jour de façon synchrone après un reset.
    pub async fn reset_node(
        &self,
        cluster: &str,
        group: &str,
        host: &str,
    ) -> Result<(), ObserverError> {
        self.backend.reset_node(cluster, group, host).await?;
        self.refresh_cluster().await
    }
}
