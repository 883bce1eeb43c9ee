//! Crate-level error aggregate.
//!
//! Each component owns its own `thiserror`/`miette::Diagnostic` error enum
//! (see [`crate::kv::KvError`], [`crate::registry::RegistryError`],
//! [`crate::queue::QueueError`], [`crate::worker_manager::ManagerError`]).
//! [`CoreError`] exists for call sites that need one return type across
//! components, such as [`crate::worker_manager::WorkerManager::spawn_worker`].

use miette::Diagnostic;
use thiserror::Error;

use crate::kv::KvError;
use crate::queue::QueueError;
use crate::reaper::ReaperError;
use crate::registry::RegistryError;
use crate::worker_manager::ManagerError;

#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reaper(#[from] ReaperError),
}
