//! Connection authentication.
//!
//! Consulted by the connection setup in [`crate::broker`], never by the
//! consumption paths directly.

pub mod scram;
pub mod token;

pub use scram::{ScramClient, ScramHash};
pub use token::{TokenConfig, TokenFetcher, TokenProvider};
