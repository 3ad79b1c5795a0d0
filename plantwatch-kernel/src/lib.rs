//! PLANTWATCH KERNEL
//!
//! Deux étages reliés par MQTT :
//! - collecte planifiée : bridge → registre de jobs → collecteur HTTP → publisher
//! - ingestion bufferisée : listener MQTT → ingestor → store (écriture par lots)

pub mod bridge;
pub mod collector;
pub mod config;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod publisher;
pub mod scheduler;
pub mod state;
pub mod store;
