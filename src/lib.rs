// Core modules
pub mod api;
pub mod config;
pub mod contract;
pub mod control;
pub mod db;
pub mod error;
pub mod exchange;
pub mod lock;
pub mod models;

// Re-export commonly used types
pub use control::{Operator, StrategyController};
pub use error::{ControlError, ControlResult};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
