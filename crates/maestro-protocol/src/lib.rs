//! Wire frames for the client message channel.
//!
//! Every message is a JSON object discriminated by its `type` field. Fields
//! are camelCase on the wire except `reply_to`, which predates the
//! convention and is kept for client compatibility.

pub mod client;
pub mod server;

pub use client::ClientCommand;
pub use server::ServerEvent;
