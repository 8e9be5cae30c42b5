//! Server module

pub mod broker;
pub mod config;
pub mod directory;
pub mod router;
pub mod worker;

pub use broker::{Broker, BrokerHandle};
pub use config::ServerConfig;
pub use directory::BackendDirectory;
pub use router::{ConnectionId, RoutingTable};
pub use worker::{Worker, WorkerPool};
