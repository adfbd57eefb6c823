//! Event-processing engine.
//!
//! - [`EventLoop`]: single owner of connection protocol state
//! - [`RequestGateway`] / [`Request`]: how other threads ask it for work
//! - forwarding tree: relay parent/child bookkeeping and termination
//! - connection arena keyed by [`ConnectionId`]

mod event_loop;
mod forward;
mod registry;
mod request;

pub use event_loop::EventLoop;
pub use registry::ConnectionId;
pub use request::{Request, RequestGateway};

pub(crate) use registry::Registry;
