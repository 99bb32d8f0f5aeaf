//! The outbound side of the serial link.

use bytes::Bytes;

use crate::Address;

/// The point-to-point link an [`crate::Endpoint`] is attached to.
///
/// Inbound frames and "ready to transmit" notifications travel the other way,
/// through [`crate::Endpoint::on_receive`] and
/// [`crate::Endpoint::on_ready_to_transmit`].
pub trait Link {
    /// Hands one frame to the link. `false` means the link is down and the
    /// frame was dropped; nothing is queued for a later retry.
    fn send(&mut self, frame: Bytes, dest: Address) -> bool;

    /// Whether the link can take another frame right now.
    fn is_ready(&self) -> bool {
        true
    }
}

impl<L: Link + ?Sized> Link for &mut L {
    fn send(&mut self, frame: Bytes, dest: Address) -> bool {
        (**self).send(frame, dest)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Link that keeps every frame, for driving the engine by hand.
#[derive(Debug, Default)]
pub struct RecordingLink {
    /// Frames accepted so far, with their destinations.
    pub sent: Vec<(Bytes, Address)>,
    /// While set, every send fails and `is_ready` is false.
    pub down: bool,
}

impl RecordingLink {
    /// An empty link that is up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything sent so far.
    pub fn take(&mut self) -> Vec<(Bytes, Address)> {
        std::mem::take(&mut self.sent)
    }
}

impl Link for RecordingLink {
    fn send(&mut self, frame: Bytes, dest: Address) -> bool {
        if self.down {
            return false;
        }
        self.sent.push((frame, dest));
        true
    }

    fn is_ready(&self) -> bool {
        !self.down
    }
}
