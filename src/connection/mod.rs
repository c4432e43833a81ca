pub mod config;
pub mod pool;

pub use config::ConnectionConfig;
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
