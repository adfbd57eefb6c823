//! Forwarding tree.
//!
//! A server link relays connect requests for peer connections. While a peer
//! waits for the relay's answer it sits in the link's forwarding list; if the
//! link goes down, every waiting peer goes down with it.
//!
//! ```text
//!   server link ── forward_list ──► [peer A, peer B, peer C]
//!        ▲                              │
//!        └──────────── parent ──────────┘   (id only, not owning)
//! ```
//!
//! Termination walks the tree depth first. Children are visited from a
//! snapshot of their ids and looked up again one at a time, so a state
//! change callback may destroy any connection (a sibling still waiting in
//! the snapshot included) without invalidating the walk. A parent's own
//! callback fires last, after its whole subtree has transitioned.

use tracing::{debug, trace};

use super::{ConnectionId, EventLoop};
use crate::connection::{Connection, ConnectionState, Mode};
use crate::core::{SdgError, SdgResult};
use crate::transport::Transport;

impl<T: Transport> EventLoop<T> {
    /// Start connecting `child` to a peer through the relay `parent`.
    ///
    /// The child enters `Connecting` in [`Mode::PeerForward`] and waits in
    /// the parent's forwarding list until [`EventLoop::resolve_forward`].
    pub fn begin_forward(&mut self, parent_id: ConnectionId, child_id: ConnectionId) -> SdgResult<()> {
        if parent_id == child_id {
            return Err(SdgError::WrongState("connection can't forward through itself"));
        }

        let parent = self.connection(parent_id)?;
        let child = self.connection(child_id)?;

        if parent.state() != ConnectionState::Connected || parent.mode() != Mode::ServerLink {
            return Err(SdgError::WrongState("relay link is not connected"));
        }
        if child.proto().parent.is_some() {
            return Err(SdgError::WrongState("connection already waits for a relay"));
        }

        parent.proto().forward_list.try_reserve(1)?;
        let _hold = self.prepare_connect(&child, Mode::PeerForward)?;

        parent.proto().forward_list.push(child_id);
        child.proto().parent = Some(parent_id);

        debug!(parent = %parent_id, child = %child_id, "forwarding request queued");
        child.transition(ConnectionState::Connecting);
        Ok(())
    }

    /// The relay answered for `child`: take it off the forwarding list and
    /// hand it its tunnel id.
    pub fn resolve_forward(
        &mut self,
        parent_id: ConnectionId,
        child_id: ConnectionId,
        tunnel_id: &[u8],
    ) -> SdgResult<()> {
        let parent = self.connection(parent_id)?;
        let child = self.connection(child_id)?;

        let mut tunnel = Vec::new();
        tunnel.try_reserve_exact(tunnel_id.len())?;
        tunnel.extend_from_slice(tunnel_id);

        {
            let mut proto = parent.proto();
            let before = proto.forward_list.len();
            proto.forward_list.retain(|c| *c != child_id);
            if proto.forward_list.len() == before {
                return Err(SdgError::WrongState("connection is not waiting for this relay"));
            }
        }

        let mut proto = child.proto();
        proto.parent = None;
        proto.tunnel_id = Some(tunnel.into_boxed_slice());

        debug!(parent = %parent_id, child = %child_id, "forwarding reply received");
        Ok(())
    }

    /// Shut `conn` down, terminate every connection waiting on it, then move
    /// it to `state`.
    ///
    /// For an `Error` termination each child inherits the parent's result
    /// and errno, so a relay failure reads the same on every forwarded peer.
    pub(crate) fn terminate(&mut self, conn: &Connection, state: ConnectionState) {
        self.deregister(conn);

        let children = std::mem::take(&mut conn.proto().forward_list);
        for child_id in children {
            let Ok(child) = self.connection(child_id) else {
                trace!(parent = %conn.id(), child = %child_id, "forwarded connection already destroyed");
                continue;
            };

            child.proto().parent = None;
            if state == ConnectionState::Error {
                child.inherit_error(conn);
            }

            debug!(parent = %conn.id(), child = %child_id, %state, "propagating termination");
            self.terminate(&child, state);
        }

        conn.transition(state);
    }
}
