//! DeskRelay Shared Types
//!
//! Wire protocol types shared by the relay server and the reconnecting client:
//! client/server events, identity types, token claims and handshake close codes.

pub mod error;
pub mod events;
pub mod types;

pub use error::*;
pub use events::*;
pub use types::*;
