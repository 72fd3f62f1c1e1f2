//! WebSocket support for real-time conversations
//!
//! # Architecture
//!
//! - **Connection**: an authenticated socket and its outbound queue
//! - **Room**: per-conversation membership, bound to a bus subscription
//! - **Pipeline**: validates, persists and fans out inbound frames
//! - **Liveness**: ping/pong sweep evicting dead sockets
//! - **Handler**: Axum WebSocket route handler (the connection gateway)

pub mod connection;
pub mod handler;
pub mod liveness;
pub mod pipeline;
pub mod room;

pub use connection::{Connection, ConnectionClosed, Outbound, SendError};
pub use handler::ws_handler;
pub use liveness::{LivenessMonitor, SweepReport};
pub use pipeline::{MessagePipeline, PipelineError};
pub use room::RoomRegistry;
