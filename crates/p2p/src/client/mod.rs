//! Client-facing wiring (§4.12): decodes bytes into wire messages, drives the protocol
//! [`fsm::handler::StateMachine`](crate::fsm::handler::StateMachine), and exposes a [`Handle`](handle::Handle)
//! the rest of the node uses to send it commands.
#![allow(clippy::inconsistent_struct_constructor)]
#![allow(clippy::type_complexity)]
mod boot_nodes;
mod controller;
pub use controller::*;
pub mod error;
pub use error::Error;

pub mod handle;
mod service;
pub(crate) mod stream;
