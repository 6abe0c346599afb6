//! Real-time messaging core: a WebSocket server with rooms and broadcast
//! fan-out, a durable SQLite message store with replay, an HTTP
//! long-polling fallback, and Prometheus metrics.

pub mod config;
pub mod error;
pub mod http;
pub mod longpoll;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod session;
pub mod store;

pub use config::{Config, WsConfig};
pub use error::{PollError, StoreError, WsError};
pub use longpoll::{LongPollBridge, LongPollManager};
pub use metrics::WsMetrics;
pub use protocol::{Envelope, Payload, Value};
pub use runtime::Runtime;
pub use server::Server;
pub use session::Session;
pub use store::{MessageStore, SqliteMessageStore};
