//! # session-core: the distributed session-worker core
//!
//! This crate implements the hard part of a horizontally scalable backend
//! that executes long-running, ordered sequences of actions ("steps") on
//! behalf of many concurrent clients, where each client corresponds to one
//! isolated *session*.
//!
//! It does **not** implement the client-facing socket gateway, the REST
//! introspection surface, container packaging, or the action executor
//! itself (browser automation or otherwise) — those are either external
//! collaborators (see [`executor`] and [`notify`] for their trait seams)
//! or out of scope entirely.
//!
//! ## Module guide
//!
//! - [`kv`] — typed async wrapper over the shared KV store (Redis), with
//!   an in-memory fake for tests.
//! - [`model`] — the data model: sessions, steps, jobs, leases.
//! - [`lease`] — the owner-tagged, TTL-bounded session lease.
//! - [`registry`] — per-session state, step history, `TTL`-refreshed
//!   records.
//! - [`queue`] — the per-session ordered job queue with retry/backoff and
//!   the completed/failed/stalled event stream.
//! - [`executor`] — the opaque `ExecuteStep` seam the worker calls into.
//! - [`notify`] — the opaque completion-notification seam the gateway
//!   implements.
//! - [`worker_manager`] — claims announced sessions, spawns one
//!   single-concurrency worker task per claimed session, drives recovery,
//!   handles `STOP`.
//! - [`reaper`] — the periodic idle-session sweep.
//! - [`config`] — environment-sourced runtime configuration.
//! - [`error`] — the crate-level error aggregate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use session_core::config::Config;
//! use session_core::kv::InMemoryKvClient;
//! use session_core::worker_manager::WorkerManager;
//! use session_core::executor::NoopExecutor;
//! use session_core::notify::NullNotifier;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let config = Config::from_env_or_default();
//! let kv = Arc::new(InMemoryKvClient::new());
//! let manager = WorkerManager::new(
//!     kv,
//!     Arc::new(NoopExecutor),
//!     Arc::new(NullNotifier),
//!     config.max_workers_per_container,
//! );
//! manager.run().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod kv;
pub mod lease;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod worker_manager;

pub use error::CoreError;
