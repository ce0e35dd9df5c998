pub mod api;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod providers;
pub mod storage;
pub mod types;

pub use config::{Config, SimConfig};
pub use error::SimError;
pub use types::*;
