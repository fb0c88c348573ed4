pub mod batch;
pub mod cas;
pub mod config;
pub mod config_store;
pub mod document;
pub mod id;
pub mod ledger;
pub mod lifecycle;
pub mod opstore;
pub mod peer_config;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod rest;
pub mod seed;
pub mod version;
pub mod watcher;
