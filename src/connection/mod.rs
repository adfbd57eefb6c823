//! Connection object model.
//!
//! - [`Connection`]: handle to one tunnel endpoint
//! - [`ConnectionState`] / [`Mode`]: state machine and role
//! - [`BufferPool`]: per-connection receive buffers

mod buffer;
#[allow(clippy::module_inception)]
mod connection;
mod receive;
mod state;

pub use buffer::{Buffer, BufferPool, PoolStats};
pub use connection::{Connection, ReceiveDataCallback, StateChangeCallback, UserData};
pub use state::{ConnectionState, Mode};

pub(crate) use connection::ConnectionInner;
pub(crate) use state::ConnectGuard;
