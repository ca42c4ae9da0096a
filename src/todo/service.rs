//! Todo use cases.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use super::{Todo, TodoRequest};
use crate::bus::EventPublisher;
use crate::storage::{Page, Result, TodoStore};

/// Todo service. Creating a todo also emits a todo-created event carrying
/// its title.
pub struct TodoService {
    store: Arc<dyn TodoStore>,
    publisher: Arc<EventPublisher>,
}

impl TodoService {
    pub fn new(store: Arc<dyn TodoStore>, publisher: Arc<EventPublisher>) -> Self {
        Self { store, publisher }
    }

    #[instrument(name = "todoService.GetAll", skip(self))]
    pub async fn get_all(&self, keyword: Option<&str>, limit: usize, offset: usize) -> Result<Page> {
        self.store.find_all(keyword, limit, offset).await
    }

    #[instrument(name = "todoService.GetByID", skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<Todo> {
        self.store.find_by_id(id).await
    }

    /// Store the todo, then publish its title. Publish failures are not
    /// reported here.
    #[instrument(name = "todoService.Create", skip(self, request), fields(title = %request.title))]
    pub async fn create(&self, request: TodoRequest) -> Result<Todo> {
        let todo = self
            .store
            .store(Todo::new(request.title, request.description))
            .await?;
        info!(id = %todo.id, "Todo created");

        let cx = tracing::Span::current().context();
        self.publisher.create(&cx, &todo.title).await;

        Ok(todo)
    }

    #[instrument(name = "todoService.Update", skip(self, request))]
    pub async fn update(&self, id: Uuid, request: TodoRequest) -> Result<Todo> {
        let mut todo = self.store.find_by_id(id).await?;
        todo.title = request.title;
        todo.description = request.description;
        todo.updated_at = Utc::now();
        self.store.update(todo).await
    }

    #[instrument(name = "todoService.Delete", skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.store.delete(id).await
    }
}
