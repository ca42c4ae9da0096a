//! In-memory todo store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{Page, Result, StoreError, TodoStore};
use crate::todo::Todo;

#[derive(Default)]
pub struct MemoryTodoStore {
    todos: RwLock<HashMap<Uuid, Todo>>,
    disconnected: AtomicBool,
}

impl MemoryTodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StoreError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl TodoStore for MemoryTodoStore {
    async fn find_all(&self, keyword: Option<&str>, limit: usize, offset: usize) -> Result<Page> {
        self.ensure_connected()?;

        let needle = keyword
            .filter(|k| !k.is_empty())
            .map(|k| k.to_lowercase());

        let todos = self.todos.read().await;
        let mut matches: Vec<&Todo> = todos
            .values()
            .filter(|todo| match &needle {
                Some(needle) => todo.title.to_lowercase().contains(needle),
                None => true,
            })
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(Page {
            total: matches.len(),
            items: matches.into_iter().skip(offset).take(limit).cloned().collect(),
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Todo> {
        self.ensure_connected()?;
        self.todos
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn store(&self, todo: Todo) -> Result<Todo> {
        self.ensure_connected()?;
        self.todos.write().await.insert(todo.id, todo.clone());
        Ok(todo)
    }

    async fn update(&self, todo: Todo) -> Result<Todo> {
        self.ensure_connected()?;
        let mut todos = self.todos.write().await;
        match todos.get_mut(&todo.id) {
            Some(existing) => {
                *existing = todo.clone();
                Ok(todo)
            }
            None => Err(StoreError::NotFound(todo.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.ensure_connected()?;
        self.todos
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            info!("Todo store disconnected");
        }
        Ok(())
    }
}
