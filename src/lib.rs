pub mod config;
pub mod engine;
pub mod limits;
pub mod locks;
pub mod model;
pub mod observability;
pub mod store;
pub mod sweeper;
pub mod wal;
