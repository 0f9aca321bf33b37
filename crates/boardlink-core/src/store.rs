//! Client-side cache of one board's items and connectors.
//!
//! Remote events are authoritative and merge by id with wholesale replacement.
//! Local intents are applied optimistically and hand back the entity to
//! publish. Creates stay pending (id `None`) until their echo arrives, at
//! which point the placeholder is reconciled in place.

use crate::errors::{EntityKind, SyncError};
use crate::model::{
    BoardId, Connector, ConnectorId, ConnectorPatch, Item, ItemId, ItemKind, ItemPatch, Position,
};
use crate::protocol::BoardEvent;

/// What [`BoardStore::apply_remote`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Nothing changed (wrong board, unknown id, missing id).
    Ignored,
    ItemInserted(ItemId),
    ItemReplaced(ItemId),
    /// A pending create received its server id.
    ItemReconciled(ItemId),
    /// An item was removed, together with the connectors attached to it.
    ItemRemoved { id: ItemId, connectors: Vec<ConnectorId> },
    ConnectorInserted(ConnectorId),
    ConnectorReplaced(ConnectorId),
    ConnectorReconciled(ConnectorId),
    ConnectorRemoved(ConnectorId),
    /// The whole board was replaced.
    Snapshot { items: usize, connectors: usize },
}

impl StoreChange {
    pub fn is_change(&self) -> bool {
        !matches!(self, StoreChange::Ignored)
    }
}

/// Items and connectors of the open board.
#[derive(Debug, Clone, Default)]
pub struct BoardStore {
    board_id: Option<BoardId>,
    items: Vec<Item>,
    connectors: Vec<Connector>,
    stale: bool,
}

impl BoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `board_id`, dropping everything held for the previous board.
    pub fn reset(&mut self, board_id: BoardId) {
        self.clear();
        self.board_id = Some(board_id);
    }

    /// Forget the board entirely.
    pub fn clear(&mut self) {
        self.board_id = None;
        self.items.clear();
        self.connectors.clear();
        self.stale = false;
    }

    pub fn board_id(&self) -> Option<BoardId> {
        self.board_id
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.iter().find(|item| item.id == Some(id))
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id == Some(id))
    }

    /// Items whose create is still waiting for its echo.
    pub fn pending_items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|item| item.is_pending())
    }

    /// Items grouped under `parent_id`.
    pub fn children_of(&self, parent_id: ItemId) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(move |item| item.parent_id == Some(parent_id))
    }

    /// Data may have missed broadcasts and should be refetched.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    fn item_index(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == Some(id))
    }

    fn connector_index(&self, id: ConnectorId) -> Option<usize> {
        self.connectors.iter().position(|c| c.id == Some(id))
    }

    fn accepts(&self, board_id: BoardId) -> bool {
        self.board_id == Some(board_id)
    }

    /// Merge an authoritative event.
    pub fn apply_remote(&mut self, event: BoardEvent) -> StoreChange {
        let Some(board_id) = self.board_id else {
            log::debug!("Ignoring {} with no board open", event.type_name());
            return StoreChange::Ignored;
        };
        match event {
            BoardEvent::CreateItem { data } => self.upsert_item(data, true),
            BoardEvent::UpdateItem { data } => self.upsert_item(data, false),
            BoardEvent::DeleteItem { item_id } => match self.detach_item(item_id) {
                Some((_, connectors)) => StoreChange::ItemRemoved { id: item_id, connectors },
                None => {
                    log::debug!("Delete for unknown item {} on board {}", item_id, board_id);
                    StoreChange::Ignored
                }
            },
            BoardEvent::CreateConnector { data } => self.upsert_connector(data, true),
            BoardEvent::UpdateConnector { data } => self.upsert_connector(data, false),
            BoardEvent::DeleteConnector { connector_id } => match self.connector_index(connector_id) {
                Some(index) => {
                    self.connectors.remove(index);
                    StoreChange::ConnectorRemoved(connector_id)
                }
                None => {
                    log::debug!("Delete for unknown connector {} on board {}", connector_id, board_id);
                    StoreChange::Ignored
                }
            },
            BoardEvent::InitialData { data } => {
                let (items, connectors) = data.into_parts();
                self.replace_all(items, connectors)
            }
        }
    }

    fn upsert_item(&mut self, item: Item, create: bool) -> StoreChange {
        let Some(id) = item.id else {
            log::warn!("Ignoring item broadcast without an id");
            return StoreChange::Ignored;
        };
        if !self.accepts(item.board_id) {
            log::debug!("Ignoring item {} for board {}", id, item.board_id);
            return StoreChange::Ignored;
        }

        let placeholder = self.find_item_placeholder(&item, create);
        if let Some(index) = self.item_index(id) {
            self.items[index] = item;
            // A placeholder can linger if the update beat the create echo.
            if let Some(p) = placeholder.filter(|&p| p != index) {
                self.items.remove(p);
            }
            return StoreChange::ItemReplaced(id);
        }
        if let Some(index) = placeholder {
            self.items[index] = item;
            return StoreChange::ItemReconciled(id);
        }
        self.items.push(item);
        StoreChange::ItemInserted(id)
    }

    /// Pending item matched by `clientRef`, or for creates without one, the
    /// oldest pending item of the same kind at the same position.
    fn find_item_placeholder(&self, echo: &Item, create: bool) -> Option<usize> {
        match echo.client_ref {
            Some(client_ref) => self
                .items
                .iter()
                .position(|p| p.is_pending() && p.client_ref == Some(client_ref)),
            None if create => self
                .items
                .iter()
                .position(|p| p.is_pending() && p.kind == echo.kind && p.position == echo.position),
            None => None,
        }
    }

    fn upsert_connector(&mut self, connector: Connector, create: bool) -> StoreChange {
        let Some(id) = connector.id else {
            log::warn!("Ignoring connector broadcast without an id");
            return StoreChange::Ignored;
        };
        if !self.accepts(connector.board_id) {
            log::debug!("Ignoring connector {} for board {}", id, connector.board_id);
            return StoreChange::Ignored;
        }
        if self.item(connector.source_item_id).is_none() || self.item(connector.target_item_id).is_none() {
            log::debug!(
                "Connector {} references missing items {} -> {}",
                id,
                connector.source_item_id,
                connector.target_item_id
            );
        }

        let placeholder = match connector.client_ref {
            Some(client_ref) => self
                .connectors
                .iter()
                .position(|p| p.is_pending() && p.client_ref == Some(client_ref)),
            None if create => self.connectors.iter().position(|p| {
                p.is_pending()
                    && p.source_item_id == connector.source_item_id
                    && p.target_item_id == connector.target_item_id
            }),
            None => None,
        };
        if let Some(index) = self.connector_index(id) {
            self.connectors[index] = connector;
            if let Some(p) = placeholder.filter(|&p| p != index) {
                self.connectors.remove(p);
            }
            return StoreChange::ConnectorReplaced(id);
        }
        if let Some(index) = placeholder {
            self.connectors[index] = connector;
            return StoreChange::ConnectorReconciled(id);
        }
        self.connectors.push(connector);
        StoreChange::ConnectorInserted(id)
    }

    /// Replace the whole board. Entities for other boards or without an id
    /// are dropped; duplicate ids keep the last occurrence. Clears staleness.
    pub fn replace_all(&mut self, items: Vec<Item>, connectors: Vec<Connector>) -> StoreChange {
        let Some(board_id) = self.board_id else {
            return StoreChange::Ignored;
        };

        let mut merged: Vec<Item> = Vec::with_capacity(items.len());
        for item in items {
            if item.id.is_none() || item.board_id != board_id {
                continue;
            }
            if !item.is_finite() {
                log::warn!("Dropping item {:?} with non-finite geometry", item.id);
                continue;
            }
            match merged.iter().position(|m| m.id == item.id) {
                Some(index) => merged[index] = item,
                None => merged.push(item),
            }
        }

        let mut links: Vec<Connector> = Vec::with_capacity(connectors.len());
        for connector in connectors {
            if connector.id.is_none() || connector.board_id != board_id {
                continue;
            }
            match links.iter().position(|m| m.id == connector.id) {
                Some(index) => links[index] = connector,
                None => links.push(connector),
            }
        }

        self.items = merged;
        self.connectors = links;
        self.stale = false;
        StoreChange::Snapshot { items: self.items.len(), connectors: self.connectors.len() }
    }

    fn require_board(&self) -> Result<BoardId, SyncError> {
        self.board_id.ok_or(SyncError::NoBoard)
    }

    /// Add a pending item of `kind` centered at `position`; returns the
    /// create intent.
    pub fn create_local(&mut self, kind: ItemKind, position: Position) -> Result<Item, SyncError> {
        let board_id = self.require_board()?;
        if !position.is_finite() {
            return Err(SyncError::NonFinite("position"));
        }
        let item = Item::pending(board_id, kind, position);
        self.items.push(item.clone());
        Ok(item)
    }

    /// Apply `patch` to item `item_id` and return the full updated item.
    pub fn mutate_local(&mut self, item_id: ItemId, patch: &ItemPatch) -> Result<Item, SyncError> {
        self.require_board()?;
        if !patch.is_finite() {
            return Err(SyncError::NonFinite("patch"));
        }
        let index = self
            .item_index(item_id)
            .ok_or(SyncError::StaleReference { kind: EntityKind::Item, id: item_id })?;
        let item = &mut self.items[index];
        patch.apply(item);
        Ok(item.clone())
    }

    /// Remove item `item_id` and every connector attached to it.
    pub fn remove_local(&mut self, item_id: ItemId) -> Result<Item, SyncError> {
        self.require_board()?;
        self.detach_item(item_id)
            .map(|(item, _)| item)
            .ok_or(SyncError::StaleReference { kind: EntityKind::Item, id: item_id })
    }

    fn detach_item(&mut self, item_id: ItemId) -> Option<(Item, Vec<ConnectorId>)> {
        let index = self.item_index(item_id)?;
        let item = self.items.remove(index);
        let mut removed = Vec::new();
        self.connectors.retain(|c| {
            if c.touches(item_id) {
                removed.extend(c.id);
                false
            } else {
                true
            }
        });
        Some((item, removed))
    }

    fn require_item(&self, item_id: ItemId) -> Result<(), SyncError> {
        match self.item(item_id) {
            Some(_) => Ok(()),
            None => Err(SyncError::StaleReference { kind: EntityKind::Item, id: item_id }),
        }
    }

    /// Add a pending connector between two known items.
    pub fn create_connector_local(
        &mut self,
        source_item_id: ItemId,
        target_item_id: ItemId,
    ) -> Result<Connector, SyncError> {
        let board_id = self.require_board()?;
        self.require_item(source_item_id)?;
        self.require_item(target_item_id)?;
        let connector = Connector::pending(board_id, source_item_id, target_item_id);
        self.connectors.push(connector.clone());
        Ok(connector)
    }

    pub fn update_connector_local(
        &mut self,
        connector_id: ConnectorId,
        patch: &ConnectorPatch,
    ) -> Result<Connector, SyncError> {
        self.require_board()?;
        if let Some(source) = patch.source_item_id {
            self.require_item(source)?;
        }
        if let Some(target) = patch.target_item_id {
            self.require_item(target)?;
        }
        let index = self.connector_index(connector_id).ok_or(SyncError::StaleReference {
            kind: EntityKind::Connector,
            id: connector_id,
        })?;
        let connector = &mut self.connectors[index];
        patch.apply(connector);
        Ok(connector.clone())
    }

    pub fn remove_connector_local(&mut self, connector_id: ConnectorId) -> Result<Connector, SyncError> {
        self.require_board()?;
        let index = self.connector_index(connector_id).ok_or(SyncError::StaleReference {
            kind: EntityKind::Connector,
            id: connector_id,
        })?;
        Ok(self.connectors.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Geometry, ItemStyle};
    use crate::protocol::InitialData;
    use std::collections::HashSet;

    const BOARD: BoardId = 1;

    fn item(id: ItemId, x: f64) -> Item {
        let mut item = Item::pending(BOARD, ItemKind::StickyNote, Position::new(x, 0.0));
        item.id = Some(id);
        item.client_ref = None;
        item
    }

    fn connector(id: ConnectorId, source: ItemId, target: ItemId) -> Connector {
        let mut connector = Connector::pending(BOARD, source, target);
        connector.id = Some(id);
        connector.client_ref = None;
        connector
    }

    fn store() -> BoardStore {
        let mut store = BoardStore::new();
        store.reset(BOARD);
        store
    }

    #[test]
    fn test_create_then_updates_leave_last_payload() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(5, 0.0) });
        for x in 1..=4 {
            store.apply_remote(BoardEvent::UpdateItem { data: item(5, f64::from(x) * 10.0) });
        }
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.items()[0], item(5, 40.0));
    }

    #[test]
    fn test_update_replaces_wholesale() {
        let mut store = store();
        let mut styled = item(2, 0.0);
        styled.style.extra.insert("fontSize".into(), 18.into());
        store.apply_remote(BoardEvent::CreateItem { data: styled });

        let mut update = item(2, 0.0);
        update.style = ItemStyle::default();
        store.apply_remote(BoardEvent::UpdateItem { data: update.clone() });
        assert_eq!(store.item(2), Some(&update));
    }

    #[test]
    fn test_update_for_unknown_id_inserts() {
        let mut store = store();
        assert_eq!(store.apply_remote(BoardEvent::UpdateItem { data: item(9, 0.0) }), StoreChange::ItemInserted(9));
        assert!(store.item(9).is_some());
    }

    #[test]
    fn test_delete_absent_id_is_noop() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        assert_eq!(store.apply_remote(BoardEvent::DeleteItem { item_id: 42 }), StoreChange::Ignored);
        assert_eq!(store.apply_remote(BoardEvent::DeleteConnector { connector_id: 42 }), StoreChange::Ignored);
        assert_eq!(store.items().len(), 1);
    }

    #[test]
    fn test_delete_cascades_connectors() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        store.apply_remote(BoardEvent::CreateItem { data: item(2, 300.0) });
        store.apply_remote(BoardEvent::CreateItem { data: item(3, 600.0) });
        store.apply_remote(BoardEvent::CreateConnector { data: connector(10, 1, 2) });
        store.apply_remote(BoardEvent::CreateConnector { data: connector(11, 2, 3) });

        let change = store.apply_remote(BoardEvent::DeleteItem { item_id: 1 });
        assert_eq!(change, StoreChange::ItemRemoved { id: 1, connectors: vec![10] });
        assert_eq!(store.connectors().len(), 1);

        store.remove_local(3).unwrap();
        assert!(store.connectors().is_empty());
    }

    #[test]
    fn test_other_board_ignored() {
        let mut store = store();
        let mut foreign = item(1, 0.0);
        foreign.board_id = 99;
        assert_eq!(store.apply_remote(BoardEvent::CreateItem { data: foreign }), StoreChange::Ignored);
        assert!(store.items().is_empty());

        let mut closed = BoardStore::new();
        assert_eq!(closed.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) }), StoreChange::Ignored);
    }

    #[test]
    fn test_pending_create_reconciled_by_client_ref() {
        let mut store = store();
        let pending = store.create_local(ItemKind::Circle, Position::new(10.0, 10.0)).unwrap();
        assert!(pending.is_pending());
        assert_eq!(pending.geometry, Geometry::new(100.0, 100.0));
        // Pending items cannot be addressed by id.
        assert_eq!(store.pending_items().count(), 1);

        let mut echo = pending.clone();
        echo.id = Some(77);
        echo.position = Position::new(12.0, 10.0);
        assert_eq!(store.apply_remote(BoardEvent::CreateItem { data: echo }), StoreChange::ItemReconciled(77));
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.item(77).map(|i| i.position), Some(Position::new(12.0, 10.0)));
        assert_eq!(store.pending_items().count(), 0);
    }

    #[test]
    fn test_pending_create_reconciled_without_client_ref() {
        let mut store = store();
        let first = store.create_local(ItemKind::Text, Position::new(5.0, 5.0)).unwrap();
        let _second = store.create_local(ItemKind::Text, Position::new(5.0, 5.0)).unwrap();

        let mut echo = first.clone();
        echo.id = Some(3);
        echo.client_ref = None;
        store.apply_remote(BoardEvent::CreateItem { data: echo });
        assert_eq!(store.items().len(), 2);
        assert_eq!(store.items()[0].id, Some(3));
        assert!(store.items()[1].is_pending());
    }

    #[test]
    fn test_unrelated_remote_create_appends() {
        let mut store = store();
        store.create_local(ItemKind::Frame, Position::new(0.0, 0.0)).unwrap();
        let change = store.apply_remote(BoardEvent::CreateItem { data: item(8, 500.0) });
        assert_eq!(change, StoreChange::ItemInserted(8));
        assert_eq!(store.items().len(), 2);
    }

    #[test]
    fn test_initial_data_dedupes_and_clears_stale() {
        let mut store = store();
        store.create_local(ItemKind::Circle, Position::new(0.0, 0.0)).unwrap();
        store.mark_stale();

        let mut foreign = item(4, 0.0);
        foreign.board_id = 2;
        let data = InitialData::Full {
            items: vec![item(1, 0.0), item(2, 0.0), item(1, 50.0), foreign],
            connectors: vec![connector(7, 1, 2)],
        };
        let change = store.apply_remote(BoardEvent::InitialData { data });
        assert_eq!(change, StoreChange::Snapshot { items: 2, connectors: 1 });
        assert!(!store.is_stale());
        assert_eq!(store.item(1).map(|i| i.position.x), Some(50.0));

        let ids: HashSet<_> = store.items().iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), store.items().len());
    }

    #[test]
    fn test_mutate_local_returns_full_item() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        let updated = store.mutate_local(1, &ItemPatch::position(30.0, 40.0)).unwrap();
        assert_eq!(updated.position, Position::new(30.0, 40.0));
        assert_eq!(updated.kind, ItemKind::StickyNote);
        assert_eq!(store.item(1), Some(&updated));
    }

    #[test]
    fn test_mutate_local_rejects_bad_input() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        assert!(matches!(
            store.mutate_local(1, &ItemPatch::position(f64::NAN, 0.0)),
            Err(SyncError::NonFinite(_))
        ));
        assert!(matches!(
            store.mutate_local(2, &ItemPatch::position(0.0, 0.0)),
            Err(SyncError::StaleReference { kind: EntityKind::Item, id: 2 })
        ));
        assert!(matches!(
            store.create_local(ItemKind::Card, Position::new(f64::INFINITY, 0.0)),
            Err(SyncError::NonFinite(_))
        ));
        assert_eq!(store.item(1).map(|i| i.position.x), Some(0.0));
    }

    #[test]
    fn test_no_board_rejects_local_intents() {
        let mut store = BoardStore::new();
        assert!(matches!(store.create_local(ItemKind::Circle, Position::default()), Err(SyncError::NoBoard)));
    }

    #[test]
    fn test_connector_local_lifecycle() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        store.apply_remote(BoardEvent::CreateItem { data: item(2, 300.0) });
        assert!(store.create_connector_local(1, 5).is_err());

        let pending = store.create_connector_local(1, 2).unwrap();
        let mut echo = pending.clone();
        echo.id = Some(20);
        assert_eq!(store.apply_remote(BoardEvent::CreateConnector { data: echo }), StoreChange::ConnectorReconciled(20));

        let patch = ConnectorPatch { target_item_id: Some(1), ..ConnectorPatch::default() };
        let updated = store.update_connector_local(20, &patch).unwrap();
        assert_eq!(updated.target_item_id, 1);
        let bad = ConnectorPatch { source_item_id: Some(99), ..ConnectorPatch::default() };
        assert!(store.update_connector_local(20, &bad).is_err());

        store.remove_connector_local(20).unwrap();
        assert!(store.connectors().is_empty());
        assert!(store.remove_connector_local(20).is_err());
    }

    #[test]
    fn test_children_of() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        let mut child = item(2, 0.0);
        child.parent_id = Some(1);
        store.apply_remote(BoardEvent::CreateItem { data: child });
        store.apply_remote(BoardEvent::CreateItem { data: item(3, 0.0) });
        let children: Vec<_> = store.children_of(1).filter_map(|i| i.id).collect();
        assert_eq!(children, vec![2]);
    }

    #[test]
    fn test_reset_switches_board() {
        let mut store = store();
        store.apply_remote(BoardEvent::CreateItem { data: item(1, 0.0) });
        store.mark_stale();
        store.reset(2);
        assert_eq!(store.board_id(), Some(2));
        assert!(store.items().is_empty());
        assert!(!store.is_stale());
    }
}
