pub mod client;
pub mod clock;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod messaging;
pub mod models;
pub mod notification;
pub mod process;
pub mod registry;
pub mod routes;
pub mod solver;
pub mod storage;

pub use error::{DispatchError, Result};
