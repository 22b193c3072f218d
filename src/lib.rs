// Library interface for Wired node components
// Shared by the `wired` binary and the integration tests

pub mod acme;
pub mod config;
pub mod deadline;
pub mod dns;
pub mod error_pages;
pub mod events;
pub mod lock_utils;
pub mod nodes;
pub mod protocol;
pub mod proxy;
pub mod replication;
pub mod snowflake;
pub mod tls;
