//! Authentication module for DeskRelay
//!
//! The relay never issues tokens; it only verifies the signed session tokens
//! presented at WebSocket handshake.

pub mod token;

pub use token::{TokenError, TokenVerifier, VerifiedIdentity};
