pub mod engine;
pub mod gateway;

pub use engine::{Engine, EngineClient, EngineError};
pub use gateway::{GatewayConnector, GatewayExchange};
