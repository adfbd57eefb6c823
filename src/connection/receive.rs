//! Inbound payload dispatch.

use std::time::Instant;

use super::Connection;
use crate::core::ErrorKind;

impl Connection {
    /// Deliver one decrypted payload to the receive callback.
    ///
    /// Applies and clears the pending discard count first: the transport
    /// sets it when the head of the next payload is framing it has already
    /// consumed. Refreshes the activity timestamp even if nothing is left to
    /// deliver.
    pub(crate) fn handle_inbound(&self, data: &[u8]) -> Result<(), ErrorKind> {
        let discard = {
            let mut proto = self.proto();
            proto.last_activity = Instant::now();
            std::mem::take(&mut proto.discard_first_bytes)
        };

        if data.len() <= discard {
            return Ok(());
        }

        match self.receive_callback() {
            Some(callback) => callback(self, &data[discard..]),
            None => Ok(()),
        }
    }
}
