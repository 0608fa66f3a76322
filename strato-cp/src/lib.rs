pub mod admission;
pub mod audit;
pub mod config;
pub mod controller;
pub mod elector;
pub mod eventbus;
pub mod ha;
pub mod model;
pub mod nodeclient;
pub mod proto;
pub mod queue;
pub mod registries;
pub mod rest;
pub mod scheduler;
pub mod server;
pub mod store;

pub use admission::Admission;
pub use audit::AuditLogger;
pub use config::Config;
pub use registries::Registries;
pub use rest::{AppState, create_router};
pub use server::{
    ControlPlane, DevFleet, add_dev_node, dev_node_info, make_connector, make_store,
    seed_dev_fleet,
};
pub use store::{MemStore, StoreError};
