//! Todo persistence.
//!
//! The store is an external collaborator of the lifecycle core: services read
//! and write through `TodoStore`, and the process entry point calls
//! `disconnect` once every subsystem has stopped.

use async_trait::async_trait;
use uuid::Uuid;

use crate::todo::Todo;

pub mod memory;

pub use memory::MemoryTodoStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Todo not found: {0}")]
    NotFound(Uuid),

    #[error("Store is disconnected")]
    Disconnected,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Todo>,
    /// Matches across all pages.
    pub total: usize,
}

/// Todo repository.
#[async_trait]
pub trait TodoStore: Send + Sync {
    /// List todos whose title contains `keyword` (case-insensitive), newest
    /// first, skipping `offset` and returning at most `limit`.
    async fn find_all(&self, keyword: Option<&str>, limit: usize, offset: usize) -> Result<Page>;

    async fn find_by_id(&self, id: Uuid) -> Result<Todo>;

    async fn store(&self, todo: Todo) -> Result<Todo>;

    async fn update(&self, todo: Todo) -> Result<Todo>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Release the backing connection. Later calls fail with `Disconnected`.
    async fn disconnect(&self) -> Result<()>;
}
