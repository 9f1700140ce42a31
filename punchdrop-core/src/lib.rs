//! # punchdrop-core
//!
//! Shared building blocks for the punchdrop hole-punched file transfer
//! protocol.
//!
//! This crate provides the foundational types used by [`punchdrop-engine`]
//! and the `punchdrop` binary.
//!
//! ## Responsibilities
//!
//! - **Frame format**: magic / packet / length framing and the packet
//!   vocabulary shared by the rendezvous service and both peers.
//!
//! - **Wire codec**: byte layouts of the file-info and chunk payloads.
//!
//! - **Errors**: the typed failure taxonomy every operation reports.
//!
//! - **Transport seams**: connection, listener and connector traits.
//!
//! - **Identity & configuration**: certificate material, rustls configs and
//!   the on-disk application directory.
pub mod config;
pub mod digest;
pub mod error;
pub mod message;
pub mod protocol;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
