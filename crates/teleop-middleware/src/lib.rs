//! `teleop-middleware` – the connection engine.
//!
//! Moves envelopes between one remote operator and the registered
//! handlers without caring what the envelopes mean.
//!
//! # Modules
//!
//! - [`codec`] – 4-byte big-endian length-prefixed JSON framing.
//! - [`queue`] – bounded FIFO with timed push and pop, used for session
//!   back-pressure.
//! - [`registry`] – immutable opcode → handler table plus enter, exit,
//!   routine and login hooks.
//! - [`session`] – per-connection dispatcher in async or sync mode.
//! - [`listener`] – TCP accept loop serving one session at a time.

pub mod codec;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod session;

pub use queue::BoundedQueue;
pub use listener::{Listener, ListenerConfig, ListenerExit};
pub use registry::{HandlerRegistry, LoginOutcome, RegistryBuilder, Reply};
pub use session::{Mode, Session, SessionConfig, SessionEnd, SessionStatus};
