//! Configuration module for the Pipewright engine.
//!
//! Settings are loaded from environment variables with the `envy` crate.

mod engine;

pub use engine::EngineConfig;
