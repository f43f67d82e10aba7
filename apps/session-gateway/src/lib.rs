pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod media;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod store_postgres;
pub mod store_redis;
pub mod telemetry;
pub mod testing;

pub use error::SessionError;
pub use manager::{ManagerOptions, SessionManager};
