//! # punchdrop-engine
//!
//! Runtime logic for punchdrop, embedded into the `punchdrop` binary.
//!
//! This crate provides:
//! - **Message channel**: typed, ordered messages over any `Connection`,
//!   with a dedicated reader task
//! - **Transports**: QUIC (quinn + rustls) and in-memory pipes
//! - **Rendezvous**: the client handshake for both roles, and the service
//! - **Peer connector**: bounded, cancellable dial loop and version handshake
//! - **Transfer pipeline**: sender and receiver state machines with
//!   end-to-end checksum verification
//! - **Sessions**: complete uploads and downloads built from the above

pub mod channel;
pub mod connector;
pub mod memory;
pub mod pipeline;
pub mod quic;
pub mod rendezvous;
pub mod rendezvous_server;
pub mod session;
