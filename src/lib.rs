//! Sandboxed code runner: admits submitted programs through a bounded queue
//! and runs each in a throwaway, resource-capped container.

pub mod config;
pub mod container;
pub mod deadline;
pub mod docker;
pub mod error;
pub mod http_server;
pub mod output;
pub mod profile;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod workspace;
