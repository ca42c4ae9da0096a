//! Todo-created notification handler.

use async_trait::async_trait;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use tracing::info;

use crate::bus::{HandlerResult, PayloadHandler};

/// Sends the "new todo" email for each todo-created event.
///
/// Delivery is a log line for now; the payload is the todo title.
#[derive(Debug, Default)]
pub struct TodoNotifier;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("empty notification payload")]
    Empty,

    #[error("notification payload is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

#[async_trait]
impl PayloadHandler for TodoNotifier {
    async fn handle(&self, cx: &Context, payload: &[u8]) -> HandlerResult {
        let recipient = std::str::from_utf8(payload).map_err(NotifyError::from)?;
        if recipient.is_empty() {
            return Err(NotifyError::Empty.into());
        }

        cx.span()
            .set_attribute(KeyValue::new("notification.recipient", recipient.to_string()));
        info!("Send email to: {}", recipient);
        Ok(())
    }
}
