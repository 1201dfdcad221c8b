//! Two-ended message channels whose sending end can itself be transferred.

use std::fmt;

use tokio::sync::mpsc;

use crate::command::Request;

/// Sending end of a message channel. Moving a `Port` inside a message hands
/// the other side a live line back to whatever serves the [`Inbox`].
#[derive(Clone)]
pub struct Port(mpsc::UnboundedSender<Request>);

/// Receiving end of a message channel.
pub struct Inbox(mpsc::UnboundedReceiver<Request>);

/// Open a new channel. Messages are delivered in the order they are sent.
pub fn message_channel() -> (Port, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Port(tx), Inbox(rx))
}

impl Port {
    /// Queue a request. Hands it back if the receiving end is gone.
    pub(crate) fn send(&self, request: Request) -> Result<(), Request> {
        self.0.send(request).map_err(|err| err.0)
    }

    /// Whether the receiving end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn same_channel(&self, other: &Port) -> bool {
        self.0.same_channel(&other.0)
    }
}

impl Inbox {
    pub(crate) async fn recv(&mut self) -> Option<Request> {
        self.0.recv().await
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port").field("closed", &self.is_closed()).finish()
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}
