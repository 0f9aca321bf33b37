//! In-memory connection for tests and embedding.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

use super::{Connection, Endpoint, LinkEvent, TransportError, validate_endpoint};
use crate::protocol::{ClientFrame, ServerFrame};

#[derive(Default)]
struct Shared {
    open: bool,
    opened: Vec<Endpoint>,
    closes: usize,
    sent: Vec<String>,
    inbox: VecDeque<LinkEvent>,
}

/// Connection that talks to a [`MemoryHandle`] instead of a socket.
///
/// The handle plays the server: it decides when the link comes up or drops,
/// delivers frames, and records everything the client sent.
pub struct MemoryConnection {
    shared: Rc<RefCell<Shared>>,
}

/// Server side of a [`MemoryConnection`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Rc<RefCell<Shared>>,
}

impl MemoryConnection {
    pub fn new() -> (Self, MemoryHandle) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (Self { shared: shared.clone() }, MemoryHandle { shared })
    }
}

impl Connection for MemoryConnection {
    fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        validate_endpoint(endpoint)?;
        let mut shared = self.shared.borrow_mut();
        if shared.open {
            return Err(TransportError::AlreadyConnected);
        }
        shared.open = true;
        shared.opened.push(endpoint.clone());
        Ok(())
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let mut shared = self.shared.borrow_mut();
        if !shared.open {
            return Err(TransportError::NotConnected);
        }
        shared.sent.push(text);
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<LinkEvent> {
        self.shared.borrow_mut().inbox.drain(..).collect()
    }

    fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if shared.open {
            shared.open = false;
            shared.closes += 1;
        }
        shared.inbox.clear();
    }
}

impl MemoryHandle {
    fn push(&self, event: LinkEvent) {
        self.shared.borrow_mut().inbox.push_back(event);
    }

    /// Bring the link up.
    pub fn accept(&self) {
        self.push(LinkEvent::Connected);
    }

    /// Drop the link; the client starts reconnecting.
    pub fn drop_link(&self) {
        self.push(LinkEvent::Disconnected);
    }

    pub fn deliver(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => self.push(LinkEvent::Text(text)),
            Err(e) => log::error!("Failed to encode server frame: {}", e),
        }
    }

    pub fn deliver_text(&self, text: impl Into<String>) {
        self.push(LinkEvent::Text(text.into()));
    }

    /// Deliver `payload` on `topic`.
    pub fn message(&self, topic: &str, payload: Value) {
        self.deliver(&ServerFrame::Message { topic: topic.to_string(), payload });
    }

    /// Drain and decode frames the client sent.
    pub fn take_sent(&self) -> Vec<ClientFrame> {
        self.shared
            .borrow_mut()
            .sent
            .drain(..)
            .filter_map(|text| match serde_json::from_str(&text) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    log::warn!("Client sent an undecodable frame: {}", e);
                    None
                }
            })
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.shared.borrow().open
    }

    /// Endpoints passed to `open`, in order.
    pub fn opened(&self) -> Vec<Endpoint> {
        self.shared.borrow().opened.clone()
    }

    pub fn close_count(&self) -> usize {
        self.shared.borrow().closes
    }
}
