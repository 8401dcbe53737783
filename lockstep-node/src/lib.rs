//! # lockstep-node: Lockstep Demo Node
//!
//! Runs one lockstep session at a fixed tick rate. Every tick enqueues a
//! `tick` action carrying a counter on every host, then logs what each
//! host contributed once the iteration resolves.
//!
//! ## Modes
//!
//! - **Local**: a single-host session with zero latency.
//! - **Listen**: admit peers on a UDP rendezvous port.
//! - **Connect**: join a listening node.

pub mod config;
pub mod service;
