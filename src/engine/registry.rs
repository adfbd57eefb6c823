//! Arena of live connections.
//!
//! Connections refer to each other (relay parent and forwarded children) by
//! [`ConnectionId`] only. A lookup that fails means the connection has been
//! destroyed, which is how the forwarding engine survives callbacks that
//! destroy connections it is about to visit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionInner;
use crate::core::{SdgError, SdgResult};

/// Stable identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Numeric value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Default)]
struct Slots {
    next_id: u32,
    live: HashMap<ConnectionId, Arc<ConnectionInner>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    /// Allocate an id and store the connection built for it.
    pub(crate) fn insert<F>(&self, make: F) -> SdgResult<Arc<ConnectionInner>>
    where
        F: FnOnce(ConnectionId) -> ConnectionInner,
    {
        let mut slots = self.slots.lock();
        slots.live.try_reserve(1)?;

        let id = ConnectionId(slots.next_id);
        slots.next_id = slots
            .next_id
            .checked_add(1)
            .ok_or_else(|| SdgError::Memory("connection ids exhausted".into()))?;

        let inner = Arc::new(make(id));
        slots.live.insert(id, inner.clone());
        Ok(inner)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionInner>> {
        self.slots.lock().live.get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionInner>> {
        self.slots.lock().live.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().live.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.lock().live.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.slots.lock().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
