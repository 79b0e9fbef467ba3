//! Minimal real-time text relay over TCP.
//!
//! Clients connect, send a display name, then exchange short messages with
//! one named peer or with everyone. Each module owns one concern:
//!
//! - [`frame`] delimits payloads on the stream with newline framing.
//! - [`protocol`] parses `recipient:content` payloads and encodes the
//!   server's relayed messages and `USERLIST:` membership updates.
//! - [`connection`] pairs an accepted stream with its lifecycle state.
//! - [`registry`] is the lock-protected table of who is online.
//! - [`router`] resolves recipients and writes to their streams.
//! - [`session`] runs the per-connection read loop.
//! - [`listener`] accepts TCP connections and spawns sessions.
//! - [`cli`] and [`client`] provide the command line and a terminal peer.

pub mod cli;
pub mod client;
pub mod connection;
pub mod frame;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
