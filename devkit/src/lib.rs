/*!
# Opwatch DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement et les tests du kernel avec:
- Stub d'agent de nœud PHP (contrat status/reset/invalidate) sans parc réel
- Fixtures JSON des payloads agent
*/

pub mod agent_stub;
pub mod fixtures;

pub use agent_stub::StubAgent;
