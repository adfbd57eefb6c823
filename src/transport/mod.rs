//! Transport collaborator boundary.
//!
//! Socket I/O, packet framing and session encryption live outside this
//! crate. The event loop talks to them through [`Transport`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        user callbacks                   │
//! ├─────────────────────────────────────────┤
//! │   connection core / event loop          │  ← this crate
//! ├─────────────────────────────────────────┤
//! │   Transport (framing, handshake, AEAD)  │  ← this module's trait
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub use error::*;
pub use traits::*;
