//! Peer-to-peer networking and header synchronization core.
//!
//! This crate owns everything between the wire (framed messages, defined in `hdr-types`) and
//! the chain's own validation logic: connection lifecycle and handshake, address management,
//! ban/discourage tracking, ping liveness, header synchronization, and block-announcement
//! relay. Header and block *validation* is out of scope — it's consumed through the narrow
//! [`chainstate::Chainstate`] trait, implemented in production by a `ChainstateManager` this
//! crate never sees.
#![allow(clippy::inconsistent_struct_constructor)]
#![allow(clippy::type_complexity)]

pub mod chainstate;
pub mod client;
pub mod common;
pub mod fsm;
pub mod net;

pub use chainstate::{ChainParams, Chainstate, MemoryChainstate};
pub use client::{Config as P2PConfig, Error};
pub use fsm::handler::{Command, DisconnectReason, Peer, PeerId};
