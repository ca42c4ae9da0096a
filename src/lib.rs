//! Courier - todo service with traced broker dispatch
//!
//! An HTTP todo API that emits a todo-created event to a message broker and
//! consumes it again to send a notification, with W3C trace context carried
//! through both hops and a coordinated, deadline-bounded shutdown.

pub mod bus;
pub mod config;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod todo;
