pub mod clock;
pub mod config;
pub mod engine;
pub mod facility;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
