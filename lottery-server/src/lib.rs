//! Lottery bet intake service.
//!
//! Agencies connect over TCP, submit batches of bets in length-prefixed
//! frames and finally report `ALL_SENT`. Once every expected agency has
//! finished, the winner set is computed exactly once and each agency can
//! ask for its own winners with `BET_RESULT,<agency>`.
//!
//! - [`cli`] parses the command line and environment configuration.
//! - [`bet`] defines the bet record and the win predicate.
//! - [`frame`] reads and writes whole frames over a byte stream.
//! - [`message`] encodes and decodes the request and response vocabulary.
//! - [`store`] persists bets and serializes access to them.
//! - [`draw`] holds the agency barrier and the cached winner set.
//! - [`worker`] runs the per-connection state machine.
//! - [`server`] accepts connections and spawns a worker for each one.
//!
//! Integration tests drive a real listener through this crate's public API.

pub mod bet;
pub mod cli;
pub mod draw;
pub mod frame;
pub mod message;
pub mod server;
pub mod store;
pub mod worker;
