use thiserror::Error;

/// Erreurs de collecte / commande vers les nœuds observés.
///
/// Clonable : le résultat d'un cycle de refresh partagé est rediffusé tel
/// quel aux appelants coalescés.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObserverError {
    /// Réseau ou nœud injoignable : l'état précédent reste valide,
    /// l'appelant peut réessayer.
    #[error("transport: {0}")]
    Transport(String),

    /// Erreur rapportée par l'agent lui-même (extension absente,
    /// script inconnu...) : remontée telle quelle, jamais réessayée.
    #[error("agent: {0}")]
    Agent(String),

    /// Coordonnées hors de la topologie configurée.
    #[error("unknown node {cluster}/{group}/{host}")]
    UnknownNode {
        cluster: String,
        group: String,
        host: String,
    },
}

impl From<reqwest::Error> for ObserverError {
    fn from(err: reqwest::Error) -> Self {
        ObserverError::Transport(err.to_string())
    }
}
