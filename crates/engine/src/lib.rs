//! Pipewright Engine Library
//!
//! State-machine execution and resumption for deployment workflows:
//!
//! - **Graph**: immutable workflow graphs compiled from definitions
//! - **Instances**: persisted per-node execution records and their lifecycle
//! - **Context**: expression rendering over the context-element stack with
//!   late-bound, maskable secrets
//! - **Engine**: executor, resume callbacks and the interrupt manager
//!
//! ## Architecture
//!
//! A state either completes synchronously or suspends on correlation ids.
//! Suspended instances hold no task; the wait-notify collaborator calls back
//! into the executor when every id has a response. All record changes go
//! through optimistic-concurrency updates, so resumes and interrupts that
//! race are resolved by the store rather than by locks.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`context`]: Execution context, rendering, variables and sweeping outputs
//! - [`engine`]: Executor and interrupt manager
//! - [`error`]: Error taxonomy
//! - [`graph`]: Definitions and compiled state machines
//! - [`instance`]: Execution records, statuses and interrupts
//! - [`notify`]: Wait-notify contract and in-memory engine
//! - [`secrets`]: Variable sources, secret manager and local AES-GCM store
//! - [`state`]: State contract and registry
//! - [`store`]: Persistence contracts and in-memory stores
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipewright_engine::{
//!     config::EngineConfig,
//!     engine::{Collaborators, StateMachineExecutor},
//!     notify::WaitNotifyEngine,
//!     secrets::LocalSecretStore,
//! };
//!
//! let config = EngineConfig::from_env()?;
//! let secrets = Arc::new(LocalSecretStore::from_config(&config)?);
//! let collaborators = Collaborators::in_memory(WaitNotifyEngine::new(), secrets);
//! let executor = StateMachineExecutor::new(config, collaborators)?;
//! let machine = executor.register_workflow("app", &definition, &registry).await?;
//! executor.start_execution("app", &machine.uuid, vec![]).await?;
//! executor.wait_idle().await;
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod instance;
pub mod notify;
pub mod result_ext;
pub mod secrets;
pub mod state;
pub mod store;

pub use error::{EngineError, EngineResult};
pub use result_ext::ResultExt;
