pub mod config;
mod db;
pub mod migration;
pub mod store;

pub use config::{DatabaseConfig, LimitsConfig, PersonaConfig, PoolConfig, ValidationMode};
pub use persona_core::*;
pub use store::PersonaStore;
