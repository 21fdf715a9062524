//! Common types, protocol definitions, and errors shared across the akeso crates.

pub mod error;
pub mod protocol;

pub use error::EngineError;
pub use protocol::StrategyTag;
