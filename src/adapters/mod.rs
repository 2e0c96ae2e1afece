//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod file_config_adapter;
pub mod sim_broker;
pub mod vec_feed;
#[cfg(feature = "sqlite")]
pub mod sqlite_session_store;
