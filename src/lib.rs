pub mod auth;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod service;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;
