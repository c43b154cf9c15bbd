//! WebSocket ingestion endpoint.
//!
//! Each accepted connection becomes a [`Session`]: a receive loop feeding an
//! in-memory queue, a persistence consumer draining it into an
//! [`ingest_store::EnvelopeSink`], and a liveness watcher that cancels the
//! receive loop when the transport dies without a close handshake.

pub mod config;
pub mod consumer;
pub mod queue;
pub mod receive;
pub mod server;
pub mod session;
pub mod transport;
pub mod watcher;

pub use config::{ExhaustedPolicy, IngestConfig, LivenessConfig, RetryPolicy};
pub use consumer::{ConsumerReport, PersistenceConsumer};
pub use queue::{EventQueue, QueueClosed, QueueReader, QueueWriter};
pub use receive::{ReceiveLoop, ReceiveOutcome};
pub use server::{build_router, default_routes, start, ApiError, AppState, ServerConfig, ServerHandle};
pub use session::{Session, SessionCoordinator, SessionRegistry, SessionReport};
pub use transport::{split_socket, CloseInfo, Frame, FrameReader, FrameWriter, LinkMonitor};
pub use watcher::{LivenessWatcher, WatchOutcome};
