//! Authoritative in-memory board state kept by the relay.

use std::collections::BTreeMap;

use boardlink_core::model::{BoardId, Connector, ConnectorId, Item, ItemId};
use boardlink_core::protocol::{
    BoardEvent, DeleteConnectorRequest, DeleteItemRequest, Destination, InitialData,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("Missing id")]
    MissingId,
    #[error("Item {0} not found")]
    UnknownItem(ItemId),
    #[error("Connector {0} not found")]
    UnknownConnector(ConnectorId),
    #[error("Position and geometry must be finite")]
    NonFinite,
    #[error("Destination {0:?} does not modify the board")]
    ReadOnly(Destination),
}

/// Items and connectors of one board. Ids are assigned here.
pub struct Board {
    board_id: BoardId,
    next_id: i64,
    items: BTreeMap<ItemId, Item>,
    connectors: BTreeMap<ConnectorId, Connector>,
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, BoardError> {
    Ok(serde_json::from_value(payload)?)
}

impl Board {
    pub fn new(board_id: BoardId) -> Self {
        Self {
            board_id,
            next_id: 1,
            items: BTreeMap::new(),
            connectors: BTreeMap::new(),
        }
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Apply a publish and return the events to broadcast.
    pub fn apply(&mut self, destination: Destination, payload: Value) -> Result<Vec<BoardEvent>, BoardError> {
        match destination {
            Destination::ItemCreate => self.create_item(decode(payload)?).map(|e| vec![e]),
            Destination::ItemUpdate => self.update_item(decode(payload)?).map(|e| vec![e]),
            Destination::ItemDelete => {
                let request: DeleteItemRequest = decode(payload)?;
                self.delete_item(request.item_id)
            }
            Destination::ConnectorCreate => self.create_connector(decode(payload)?).map(|e| vec![e]),
            Destination::ConnectorUpdate => self.update_connector(decode(payload)?).map(|e| vec![e]),
            Destination::ConnectorDelete => {
                let request: DeleteConnectorRequest = decode(payload)?;
                self.delete_connector(request.connector_id).map(|e| vec![e])
            }
            Destination::Sync => Err(BoardError::ReadOnly(destination)),
        }
    }

    pub fn create_item(&mut self, mut item: Item) -> Result<BoardEvent, BoardError> {
        if !item.is_finite() {
            return Err(BoardError::NonFinite);
        }
        let id = self.allocate_id();
        item.id = Some(id);
        item.board_id = self.board_id;
        self.items.insert(id, item.clone());
        Ok(BoardEvent::CreateItem { data: item })
    }

    /// Replace an existing item wholesale.
    pub fn update_item(&mut self, mut item: Item) -> Result<BoardEvent, BoardError> {
        let id = item.id.ok_or(BoardError::MissingId)?;
        if !item.is_finite() {
            return Err(BoardError::NonFinite);
        }
        let slot = self.items.get_mut(&id).ok_or(BoardError::UnknownItem(id))?;
        item.board_id = self.board_id;
        item.client_ref = None;
        *slot = item.clone();
        Ok(BoardEvent::UpdateItem { data: item })
    }

    /// Delete an item, its connectors, and detach its children.
    pub fn delete_item(&mut self, item_id: ItemId) -> Result<Vec<BoardEvent>, BoardError> {
        self.items.remove(&item_id).ok_or(BoardError::UnknownItem(item_id))?;
        let mut events = vec![BoardEvent::DeleteItem { item_id }];

        let attached: Vec<ConnectorId> = self
            .connectors
            .iter()
            .filter(|(_, c)| c.touches(item_id))
            .map(|(&id, _)| id)
            .collect();
        for connector_id in attached {
            self.connectors.remove(&connector_id);
            events.push(BoardEvent::DeleteConnector { connector_id });
        }

        for child in self.items.values_mut().filter(|i| i.parent_id == Some(item_id)) {
            child.parent_id = None;
            events.push(BoardEvent::UpdateItem { data: child.clone() });
        }
        Ok(events)
    }

    fn require_item(&self, item_id: ItemId) -> Result<(), BoardError> {
        if self.items.contains_key(&item_id) {
            Ok(())
        } else {
            Err(BoardError::UnknownItem(item_id))
        }
    }

    pub fn create_connector(&mut self, mut connector: Connector) -> Result<BoardEvent, BoardError> {
        self.require_item(connector.source_item_id)?;
        self.require_item(connector.target_item_id)?;
        let id = self.allocate_id();
        connector.id = Some(id);
        connector.board_id = self.board_id;
        self.connectors.insert(id, connector.clone());
        Ok(BoardEvent::CreateConnector { data: connector })
    }

    pub fn update_connector(&mut self, mut connector: Connector) -> Result<BoardEvent, BoardError> {
        let id = connector.id.ok_or(BoardError::MissingId)?;
        self.require_item(connector.source_item_id)?;
        self.require_item(connector.target_item_id)?;
        let slot = self.connectors.get_mut(&id).ok_or(BoardError::UnknownConnector(id))?;
        connector.board_id = self.board_id;
        connector.client_ref = None;
        *slot = connector.clone();
        Ok(BoardEvent::UpdateConnector { data: connector })
    }

    pub fn delete_connector(&mut self, connector_id: ConnectorId) -> Result<BoardEvent, BoardError> {
        self.connectors
            .remove(&connector_id)
            .ok_or(BoardError::UnknownConnector(connector_id))?;
        Ok(BoardEvent::DeleteConnector { connector_id })
    }

    /// Full contents, as sent in reply to a sync request.
    pub fn snapshot(&self) -> BoardEvent {
        BoardEvent::InitialData {
            data: InitialData::Full {
                items: self.items.values().cloned().collect(),
                connectors: self.connectors.values().cloned().collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_core::model::{ItemKind, Position};
    use serde_json::json;

    fn created_id(event: &BoardEvent) -> i64 {
        match event {
            BoardEvent::CreateItem { data } => data.id.unwrap(),
            BoardEvent::CreateConnector { data } => data.id.unwrap(),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_create_assigns_ids_and_keeps_client_ref() {
        let mut board = Board::new(3);
        let pending = Item::pending(99, ItemKind::Circle, Position::new(1.0, 2.0));
        let event = board.create_item(pending.clone()).unwrap();
        match &event {
            BoardEvent::CreateItem { data } => {
                assert_eq!(data.id, Some(1));
                assert_eq!(data.board_id, 3);
                assert_eq!(data.client_ref, pending.client_ref);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let second = board.create_item(pending).unwrap();
        assert_eq!(created_id(&second), 2);
    }

    #[test]
    fn test_update_requires_known_item() {
        let mut board = Board::new(1);
        let mut item = Item::pending(1, ItemKind::Text, Position::new(0.0, 0.0));
        assert!(matches!(board.update_item(item.clone()), Err(BoardError::MissingId)));
        item.id = Some(5);
        assert!(matches!(board.update_item(item), Err(BoardError::UnknownItem(5))));
    }

    #[test]
    fn test_delete_cascades() {
        let mut board = Board::new(1);
        let a = created_id(&board.create_item(Item::pending(1, ItemKind::Frame, Position::default())).unwrap());
        let b = created_id(&board.create_item(Item::pending(1, ItemKind::Card, Position::default())).unwrap());
        let mut child = Item::pending(1, ItemKind::Text, Position::default());
        child.parent_id = Some(a);
        board.create_item(child).unwrap();
        let link = created_id(&board.create_connector(Connector::pending(1, a, b)).unwrap());

        let events = board.delete_item(a).unwrap();
        assert_eq!(events[0], BoardEvent::DeleteItem { item_id: a });
        assert!(events.contains(&BoardEvent::DeleteConnector { connector_id: link }));
        assert!(events.iter().any(|e| matches!(e, BoardEvent::UpdateItem { data } if data.parent_id.is_none())));
        assert!(matches!(board.delete_item(a), Err(BoardError::UnknownItem(_))));
    }

    #[test]
    fn test_connector_requires_items() {
        let mut board = Board::new(1);
        assert!(matches!(
            board.create_connector(Connector::pending(1, 1, 2)),
            Err(BoardError::UnknownItem(1))
        ));
    }

    #[test]
    fn test_apply_decodes_payloads() {
        let mut board = Board::new(2);
        let pending = Item::pending(2, ItemKind::StickyNote, Position::new(5.0, 5.0));
        let events = board
            .apply(Destination::ItemCreate, serde_json::to_value(&pending).unwrap())
            .unwrap();
        let id = created_id(&events[0]);

        let events = board.apply(Destination::ItemDelete, json!({"itemId": id})).unwrap();
        assert_eq!(events, vec![BoardEvent::DeleteItem { item_id: id }]);
        assert!(matches!(
            board.apply(Destination::ItemUpdate, json!({"bogus": true})),
            Err(BoardError::InvalidPayload(_))
        ));
        assert!(matches!(board.apply(Destination::Sync, json!({})), Err(BoardError::ReadOnly(_))));
    }

    #[test]
    fn test_snapshot_lists_everything() {
        let mut board = Board::new(1);
        board.create_item(Item::pending(1, ItemKind::Shape, Position::default())).unwrap();
        board.create_item(Item::pending(1, ItemKind::Shape, Position::default())).unwrap();
        match board.snapshot() {
            BoardEvent::InitialData { data: InitialData::Full { items, connectors } } => {
                assert_eq!(items.len(), 2);
                assert!(connectors.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
