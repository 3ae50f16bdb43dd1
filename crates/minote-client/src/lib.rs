//! Client-side offline-first synchronization engine for the Mi Cloud
//! notes service.
//!
//! The kernel mediates between a local redb store and the remote HTTP
//! API so that notes and folders can be created, edited, and deleted
//! regardless of network state, with eventual convergence to the
//! server's truth. Local intents are applied at most once, active edits
//! are protected from remote overwrites, and client-assigned temporary
//! ids are transparently remapped once the server issues canonical
//! ones.

pub mod api;
pub mod auth;
pub mod blob;
pub mod bus;
mod client;
pub mod config;
pub mod handlers;
pub mod id_map;
pub mod net;
pub mod online;
pub mod processor;
pub mod queue;
pub mod session;
pub mod startup;
pub mod store;
pub mod sync;
mod task;
pub mod transport;

pub use client::{Client, ClientHandle, ClientRef, InitError, InitResult};

pub(crate) const LOG_TARGET: &str = "minote::client";
