pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reconciler;
pub mod sql;
pub mod wal;
pub mod wire;
