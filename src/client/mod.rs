//! Client context and configuration.

#[allow(clippy::module_inception)]
mod client;

pub use client::{Client, ClientBuilder, ClientConfig};

pub(crate) use client::Shared;
