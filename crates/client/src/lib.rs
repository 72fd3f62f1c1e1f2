//! DeskRelay Client
//!
//! Self-reconnecting connection to a DeskRelay gateway. Every attempt fetches a
//! fresh session token, failed attempts back off exponentially up to a cap, and
//! the driver gives up after a bounded number of consecutive failures.

pub mod backoff;
pub mod driver;
pub mod error;
pub mod token;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use driver::{ConnectionState, DriverEvent, ReconnectingClient};
pub use error::{ClientError, ConnectError, TokenSourceError};
pub use token::{HttpTokenSource, TokenSource};
pub use transport::{Connector, Session, SessionEvent, WsConnector, WsSession};
