//! The socket between a procmux host and its helper binary.
//!
//! Unix-only: the launcher connection is a Unix domain socket. The host
//! binds a [`LocalListener`] and polls it for the one helper connection;
//! the helper side (and the test suite) uses [`LocalStream::connect`] or
//! [`LocalStream::pair`]. Everything above this layer sees only a duplex
//! byte stream.

pub mod error;
pub mod stream;
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::{LocalStream, PeerIdentity};
pub use uds::LocalListener;
