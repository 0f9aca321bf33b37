//! Board session: the one object a host owns to collaborate on a board.
//!
//! A session ties the transport, the store, the drag throttle and the error
//! channel together. Hosts call [`BoardSession::poll`] from their event loop;
//! every handler, store mutation and error callback runs inside that call.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::errors::{EntityKind, ErrorChannel, ErrorEvent, SyncError};
use crate::geometry::{self, BoundingBox, ConnectorEndpoints};
use crate::model::{
    BoardId, Connector, ConnectorId, ConnectorPatch, Item, ItemId, ItemKind, ItemPatch, Position,
};
use crate::protocol::{
    DeleteConnectorRequest, DeleteItemRequest, Destination, Inbound, SERVER_ERRORS_TOPIC,
    SyncRequest, board_topic, decode_payload,
};
use crate::store::{BoardStore, StoreChange};
use crate::throttle::Throttle;
use crate::transport::{Connection, ConnectionState, Handler, TransportAdapter, Transition};

/// Something the host may want to react to after a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(Transition),
    StoreChanged(StoreChange),
    Error(ErrorEvent),
    /// A full board snapshot was requested from the server.
    ResyncRequested(BoardId),
}

/// Collaboration session for one board at a time.
pub struct BoardSession<C: Connection> {
    config: SyncConfig,
    transport: TransportAdapter<C>,
    store: BoardStore,
    errors: ErrorChannel,
    /// Latest dragged state per item, released at most once per interval.
    drags: Throttle<ItemId, Item>,
    /// Payloads received by `handler`, drained during `poll`.
    inbox: Rc<RefCell<VecDeque<Value>>>,
    handler: Handler,
    /// Set by the transport each time the connection becomes ready.
    ready: Rc<Cell<bool>>,
}

impl<C: Connection> BoardSession<C> {
    /// Create a disconnected session.
    pub fn new(connection: C, config: SyncConfig) -> Self {
        let inbox = Rc::new(RefCell::new(VecDeque::new()));
        let sink = inbox.clone();
        let handler: Handler = Rc::new(move |payload: &Value| sink.borrow_mut().push_back(payload.clone()));
        Self {
            transport: TransportAdapter::new(connection),
            store: BoardStore::new(),
            errors: ErrorChannel::new(config.max_error_log),
            drags: Throttle::new(config.drag_throttle()),
            inbox,
            handler,
            ready: Rc::new(Cell::new(false)),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &BoardStore {
        &self.store
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorChannel {
        &mut self.errors
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &TransportAdapter<C> {
        &self.transport
    }

    // --- Lifecycle ---

    /// Start connecting to the configured endpoint.
    pub fn connect(&mut self) -> Result<(), SyncError> {
        let ready = self.ready.clone();
        self.transport.connect(&self.config.endpoint(), move || ready.set(true))?;
        self.transport.subscribe(SERVER_ERRORS_TOPIC, self.handler.clone());
        if let Some(board_id) = self.store.board_id() {
            let topic = self.topic(board_id);
            self.transport.subscribe(&topic, self.handler.clone());
        }
        Ok(())
    }

    /// Switch to `board_id`: drop the previous board, subscribe to the new
    /// topic and request its contents.
    pub fn open_board(&mut self, board_id: BoardId) {
        if let Some(previous) = self.store.board_id() {
            let topic = self.topic(previous);
            self.transport.unsubscribe(&topic);
        }
        self.drags.clear();
        self.inbox.borrow_mut().clear();
        self.store.reset(board_id);

        let topic = self.topic(board_id);
        self.transport.subscribe(&topic, self.handler.clone());
        log::info!("Opened board {}", board_id);
        self.request_sync();
    }

    /// Leave the current board.
    pub fn close_board(&mut self) {
        if let Some(board_id) = self.store.board_id() {
            let topic = self.topic(board_id);
            self.transport.unsubscribe(&topic);
            log::info!("Closed board {}", board_id);
        }
        self.drags.clear();
        self.inbox.borrow_mut().clear();
        self.store.clear();
    }

    /// Close the connection. Store contents are kept but marked stale.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.drags.clear();
        self.inbox.borrow_mut().clear();
        self.ready.set(false);
        if self.store.board_id().is_some() {
            self.store.mark_stale();
        }
    }

    /// Ask the server for a full snapshot of the open board.
    pub fn request_sync(&mut self) -> bool {
        let Some(board_id) = self.store.board_id() else {
            return false;
        };
        self.publish(Destination::Sync, &SyncRequest { board_id })
    }

    fn topic(&self, board_id: BoardId) -> String {
        board_topic(&self.config.topic_prefix, board_id)
    }

    fn publish<P: Serialize>(&self, destination: Destination, payload: &P) -> bool {
        match self.store.board_id() {
            Some(board_id) => {
                let path = destination.path(&self.config.destination_prefix, board_id);
                self.transport.publish(&path, payload)
            }
            None => false,
        }
    }

    // --- Event loop ---

    /// Process connection events and received messages, then release due
    /// drag updates.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        self.poll_at(Instant::now())
    }

    /// [`BoardSession::poll`] with an explicit clock reading.
    pub fn poll_at(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        for transition in self.transport.poll() {
            if transition.is_drop() {
                log::warn!("Connection lost; board data is stale until resync");
                self.store.mark_stale();
                self.drags.clear();
            }
            events.push(SessionEvent::StateChanged(transition));
        }

        if self.ready.replace(false) {
            if let Some(board_id) = self.store.board_id() {
                if self.request_sync() {
                    events.push(SessionEvent::ResyncRequested(board_id));
                }
            }
        }

        let payloads: Vec<Value> = self.inbox.borrow_mut().drain(..).collect();
        for payload in payloads {
            match decode_payload(&payload) {
                Ok(Inbound::Event(event)) => {
                    let change = self.store.apply_remote(event);
                    self.forget_removed_drags(&change);
                    if change.is_change() {
                        events.push(SessionEvent::StoreChanged(change));
                    }
                }
                Ok(Inbound::Error(frame)) => {
                    events.push(SessionEvent::Error(self.errors.report(&frame)));
                }
                Err(e) => log::warn!("Dropping board message: {}", e),
            }
        }

        for (_, item) in self.drags.drain_due_at(now) {
            self.publish(Destination::ItemUpdate, &item);
        }

        events
    }

    /// Pending drag updates must not outlive their item.
    fn forget_removed_drags(&mut self, change: &StoreChange) {
        match change {
            StoreChange::ItemRemoved { id, .. } => {
                if self.drags.cancel(id) {
                    log::debug!("Dropped pending drag for deleted item {}", id);
                }
            }
            StoreChange::Snapshot { .. } => {
                let store = &self.store;
                self.drags.retain(|id| store.item(*id).is_some());
            }
            _ => {}
        }
    }

    /// When the next throttled drag update falls due, for hosts that sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.drags.next_deadline()
    }

    // --- Item intents ---

    /// Create an item of `kind` centered at `position`. The returned item is
    /// pending until the server echoes it.
    pub fn create_item(&mut self, kind: ItemKind, position: Position) -> Result<Item, SyncError> {
        let item = self.store.create_local(kind, position)?;
        self.publish(Destination::ItemCreate, &item);
        Ok(item)
    }

    /// Apply a discrete edit and publish it immediately.
    pub fn update_item(&mut self, item_id: ItemId, patch: &ItemPatch) -> Result<Item, SyncError> {
        let item = self.store.mutate_local(item_id, patch)?;
        self.drags.cancel(&item_id);
        self.publish(Destination::ItemUpdate, &item);
        Ok(item)
    }

    /// Move an item during a drag. Publishes are throttled per item.
    pub fn drag_item(&mut self, item_id: ItemId, position: Position) -> Result<Item, SyncError> {
        self.drag_item_at(item_id, position, Instant::now())
    }

    /// [`BoardSession::drag_item`] with an explicit clock reading.
    pub fn drag_item_at(
        &mut self,
        item_id: ItemId,
        position: Position,
        now: Instant,
    ) -> Result<Item, SyncError> {
        let patch = ItemPatch { position: Some(position), ..ItemPatch::default() };
        let item = self.store.mutate_local(item_id, &patch)?;
        self.drags.schedule_at(item_id, item.clone(), now);
        Ok(item)
    }

    /// Finish a drag: drop any throttled update and publish the final state.
    pub fn end_drag(&mut self, item_id: ItemId) -> Result<Item, SyncError> {
        self.drags.flush(&item_id);
        let item = self
            .store
            .item(item_id)
            .cloned()
            .ok_or(SyncError::StaleReference { kind: EntityKind::Item, id: item_id })?;
        self.publish(Destination::ItemUpdate, &item);
        Ok(item)
    }

    /// Delete an item and the connectors attached to it.
    pub fn delete_item(&mut self, item_id: ItemId) -> Result<Item, SyncError> {
        let item = self.store.remove_local(item_id)?;
        self.drags.cancel(&item_id);
        self.publish(Destination::ItemDelete, &DeleteItemRequest { item_id });
        Ok(item)
    }

    // --- Connector intents ---

    pub fn create_connector(
        &mut self,
        source_item_id: ItemId,
        target_item_id: ItemId,
    ) -> Result<Connector, SyncError> {
        let connector = self.store.create_connector_local(source_item_id, target_item_id)?;
        self.publish(Destination::ConnectorCreate, &connector);
        Ok(connector)
    }

    pub fn update_connector(
        &mut self,
        connector_id: ConnectorId,
        patch: &ConnectorPatch,
    ) -> Result<Connector, SyncError> {
        let connector = self.store.update_connector_local(connector_id, patch)?;
        self.publish(Destination::ConnectorUpdate, &connector);
        Ok(connector)
    }

    pub fn delete_connector(&mut self, connector_id: ConnectorId) -> Result<Connector, SyncError> {
        let connector = self.store.remove_connector_local(connector_id)?;
        self.publish(Destination::ConnectorDelete, &DeleteConnectorRequest { connector_id });
        Ok(connector)
    }

    /// Install board contents fetched out of band (first paint).
    pub fn apply_snapshot(&mut self, items: Vec<Item>, connectors: Vec<Connector>) -> StoreChange {
        let change = self.store.replace_all(items, connectors);
        self.forget_removed_drags(&change);
        change
    }

    // --- Geometry ---

    /// Attachment points of a connector, computed from the current item
    /// positions. `None` if either end is missing.
    pub fn connector_endpoints(&self, connector_id: ConnectorId) -> Option<ConnectorEndpoints> {
        self.store.connector(connector_id).and_then(|c| self.route(c))
    }

    /// Every connector whose ends both resolve, with its attachment points.
    pub fn connector_routes(&self) -> Vec<(&Connector, ConnectorEndpoints)> {
        self.store
            .connectors()
            .iter()
            .filter_map(|c| self.route(c).map(|endpoints| (c, endpoints)))
            .collect()
    }

    fn route(&self, connector: &Connector) -> Option<ConnectorEndpoints> {
        let source = self.store.item(connector.source_item_id)?;
        let target = self.store.item(connector.target_item_id)?;
        Some(geometry::connector_endpoints(
            &BoundingBox::from_item(source),
            &BoundingBox::from_item(target),
        ))
    }
}

impl<C: Connection> Drop for BoardSession<C> {
    fn drop(&mut self) {
        self.close_board();
        self.disconnect();
    }
}
