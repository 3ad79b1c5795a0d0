/*!
# PlantWatch DevKit - Doublures et utilitaires de test

Bibliothèque pour tester le kernel sans broker, sans base et sans machines :
- publisher et store en mémoire (avec mode panne)
- source de lectures scriptée
- faux endpoint machine HTTP (axum, port éphémère)
- builders de plans, commandes et corps de réponse
- harness du pipeline complet collecte → ingestion
*/

pub mod builders;
pub mod doubles;
pub mod stub_endpoint;
pub mod test_utils;

pub use builders::{machine_body, ReadingBuilder};
pub use doubles::{MemoryReadingStore, RecordingPublisher, ScriptedSource};
pub use stub_endpoint::StubEndpoint;
pub use test_utils::{init_test_tracing, wait_until, PipelineHarness};
