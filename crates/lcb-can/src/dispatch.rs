//! Identifier/mask dispatch of frames and messages to registered handlers.

use std::sync::Arc;

use lcb_executor::Done;

use crate::frame::CanFrame;
use crate::mti::Mti;
use crate::node::{NodeHandle, NodeId};

/// Receives every frame whose identifier matches its registration.
///
/// The handler owns `done` until it has finished with the frame; dropping it
/// or calling [`Done::notify`] tells the dispatcher. Holding on to it delays
/// the next frame, which keeps handlers from racing themselves.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, frame: &CanFrame, done: Done);
}

impl<F> FrameHandler for F
where
    F: Fn(&CanFrame, Done) + Send + Sync,
{
    fn handle_frame(&self, frame: &CanFrame, done: Done) {
        self(frame, done)
    }
}

/// An OpenLCB message decoded from one or more frames, or looped back from a
/// local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub mti: Mti,
    pub src: NodeHandle,
    /// Destination of an addressed message.
    pub dst: Option<NodeHandle>,
    /// The local node an addressed message is for.
    pub dst_node: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// Receives every message whose MTI matches its registration.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: &IncomingMessage, done: Done);
}

impl<F> MessageHandler for F
where
    F: Fn(&IncomingMessage, Done) + Send + Sync,
{
    fn handle_message(&self, msg: &IncomingMessage, done: Done) {
        self(msg, done)
    }
}

struct Registration<H: ?Sized> {
    id: u32,
    mask: u32,
    handler: Arc<H>,
}

impl<H: ?Sized> Registration<H> {
    fn matches(&self, id: u32) -> bool {
        id & self.mask == self.id & self.mask
    }
}

/// Ordered list of (id, mask, handler) registrations.
///
/// Registrations may overlap; a key reaches every one that matches, in
/// registration order.
pub struct Dispatcher<H: ?Sized> {
    registrations: Vec<Registration<H>>,
}

impl<H: ?Sized> Default for Dispatcher<H> {
    fn default() -> Self {
        Dispatcher {
            registrations: Vec::new(),
        }
    }
}

impl<H: ?Sized> Dispatcher<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u32, mask: u32, handler: Arc<H>) {
        self.registrations.push(Registration { id, mask, handler });
    }

    /// Remove the registration of `handler` under exactly `id` and `mask`.
    /// Returns false if there was none.
    pub fn unregister(&mut self, id: u32, mask: u32, handler: &Arc<H>) -> bool {
        let target = Arc::as_ptr(handler) as *const ();
        let before = self.registrations.len();
        self.registrations.retain(|r| {
            !(r.id == id && r.mask == mask && Arc::as_ptr(&r.handler) as *const () == target)
        });
        self.registrations.len() != before
    }

    /// Handlers registered for `key`.
    pub fn matching(&self, key: u32) -> Vec<Arc<H>> {
        self.registrations
            .iter()
            .filter(|r| r.matches(key))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl<H: ?Sized> std::fmt::Debug for Dispatcher<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}
