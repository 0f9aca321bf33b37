//! Board entities: items, connectors and the patches applied to them.
//!
//! Field names follow the wire format (camelCase JSON). Ids are assigned by the
//! server; a `None` id marks an entity whose create has not been echoed yet.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Server-assigned board identifier.
pub type BoardId = i64;
/// Server-assigned item identifier.
pub type ItemId = i64;
/// Server-assigned connector identifier.
pub type ConnectorId = i64;
/// Client-generated correlation id carried through a create round trip.
pub type ClientRef = Uuid;

/// Kind of visual element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Circle,
    StickyNote,
    Text,
    Frame,
    Image,
    Shape,
    Card,
    AppCard,
}

impl ItemKind {
    pub const ALL: [ItemKind; 8] = [
        ItemKind::Circle,
        ItemKind::StickyNote,
        ItemKind::Text,
        ItemKind::Frame,
        ItemKind::Image,
        ItemKind::Shape,
        ItemKind::Card,
        ItemKind::AppCard,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Circle => "circle",
            ItemKind::StickyNote => "sticky_note",
            ItemKind::Text => "text",
            ItemKind::Frame => "frame",
            ItemKind::Image => "image",
            ItemKind::Shape => "shape",
            ItemKind::Card => "card",
            ItemKind::AppCard => "app_card",
        }
    }

    /// Geometry given to a freshly created item of this kind.
    pub fn default_geometry(&self) -> Geometry {
        let (width, height) = match self {
            ItemKind::Circle => (100.0, 100.0),
            ItemKind::StickyNote => (200.0, 200.0),
            ItemKind::Text => (300.0, 50.0),
            ItemKind::Frame => (800.0, 600.0),
            ItemKind::Image => (320.0, 240.0),
            ItemKind::Shape => (200.0, 120.0),
            ItemKind::Card => (320.0, 94.0),
            ItemKind::AppCard => (320.0, 160.0),
        };
        Geometry { width, height, rotation: 0.0 }
    }

    /// Style given to a freshly created item of this kind.
    pub fn default_style(&self) -> ItemStyle {
        let (color, fill) = match self {
            ItemKind::Circle => ("#1a1a1a", "#4262ff"),
            ItemKind::StickyNote => ("#1a1a1a", "#fff9b1"),
            ItemKind::Text => ("#1a1a1a", "transparent"),
            ItemKind::Frame => ("#1a1a1a", "#ffffff"),
            ItemKind::Image => ("#1a1a1a", "transparent"),
            ItemKind::Shape => ("#1a1a1a", "#ffffff"),
            ItemKind::Card => ("#1a1a1a", "#ffffff"),
            ItemKind::AppCard => ("#1a1a1a", "#ffffff"),
        };
        ItemStyle {
            color: Some(color.to_string()),
            fill_color: Some(fill.to_string()),
            extra: Map::new(),
        }
    }

    /// Content given to a freshly created item of this kind.
    pub fn default_data(&self) -> ItemData {
        let content = match self {
            ItemKind::StickyNote | ItemKind::Text | ItemKind::Card | ItemKind::AppCard => {
                Some(String::new())
            }
            ItemKind::Frame => Some("Frame".to_string()),
            ItemKind::Circle | ItemKind::Image | ItemKind::Shape => None,
        };
        ItemData { content, extra: Map::new() }
    }
}

/// Center of an item in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<Position> for Point {
    fn from(p: Position) -> Self {
        Point::new(p.x, p.y)
    }
}

impl From<Point> for Position {
    fn from(p: Point) -> Self {
        Position::new(p.x, p.y)
    }
}

/// Size and rotation of an item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: f64,
    pub height: f64,
    /// Rotation in degrees. Visual only; connector routing ignores it.
    #[serde(default)]
    pub rotation: f64,
}

impl Geometry {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height, rotation: 0.0 }
    }

    pub fn is_finite(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.rotation.is_finite()
    }
}

/// Visual style of an item. Unknown attributes are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Content of an item. Unknown attributes are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A visual element on a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// `None` until the server echoes the create.
    #[serde(default)]
    pub id: Option<ItemId>,
    pub board_id: BoardId,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub position: Position,
    pub geometry: Geometry,
    #[serde(default)]
    pub style: ItemStyle,
    #[serde(default)]
    pub data: ItemData,
    #[serde(default)]
    pub parent_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientRef>,
}

impl Item {
    /// Build a pending item with the defaults for `kind`.
    pub fn pending(board_id: BoardId, kind: ItemKind, position: Position) -> Self {
        Self {
            id: None,
            board_id,
            kind,
            position,
            geometry: kind.default_geometry(),
            style: kind.default_style(),
            data: kind.default_data(),
            parent_id: None,
            client_ref: Some(Uuid::new_v4()),
        }
    }

    /// Whether the create for this item is still awaiting its echo.
    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    /// Position and geometry contain no NaN or infinity.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.geometry.is_finite()
    }
}

/// Visual style of a connector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An edge linking two items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    #[serde(default)]
    pub id: Option<ConnectorId>,
    pub board_id: BoardId,
    pub source_item_id: ItemId,
    pub target_item_id: ItemId,
    #[serde(default)]
    pub style: ConnectorStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientRef>,
}

impl Connector {
    /// Build a pending connector between two items.
    pub fn pending(board_id: BoardId, source_item_id: ItemId, target_item_id: ItemId) -> Self {
        Self {
            id: None,
            board_id,
            source_item_id,
            target_item_id,
            style: ConnectorStyle::default(),
            client_ref: Some(Uuid::new_v4()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    /// Whether either end of this connector is `item_id`.
    pub fn touches(&self, item_id: ItemId) -> bool {
        self.source_item_id == item_id || self.target_item_id == item_id
    }
}

/// Partial update of an item. Present fields replace the item's fields
/// wholesale; nested values are not merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub position: Option<Position>,
    pub geometry: Option<Geometry>,
    pub style: Option<ItemStyle>,
    pub data: Option<ItemData>,
    /// `Some(None)` detaches the item from its parent.
    pub parent_id: Option<Option<ItemId>>,
}

impl ItemPatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self { position: Some(Position::new(x, y)), ..Self::default() }
    }

    pub fn geometry(geometry: Geometry) -> Self {
        Self { geometry: Some(geometry), ..Self::default() }
    }

    pub fn content(content: impl Into<String>, current: &ItemData) -> Self {
        let mut data = current.clone();
        data.content = Some(content.into());
        Self { data: Some(data), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Reject patches that would store NaN or infinity.
    pub fn is_finite(&self) -> bool {
        self.position.is_none_or(|p| p.is_finite()) && self.geometry.is_none_or(|g| g.is_finite())
    }

    pub fn apply(&self, item: &mut Item) {
        if let Some(position) = self.position {
            item.position = position;
        }
        if let Some(geometry) = self.geometry {
            item.geometry = geometry;
        }
        if let Some(style) = &self.style {
            item.style = style.clone();
        }
        if let Some(data) = &self.data {
            item.data = data.clone();
        }
        if let Some(parent_id) = self.parent_id {
            item.parent_id = parent_id;
        }
    }
}

/// Partial update of a connector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorPatch {
    pub source_item_id: Option<ItemId>,
    pub target_item_id: Option<ItemId>,
    pub style: Option<ConnectorStyle>,
}

impl ConnectorPatch {
    pub fn apply(&self, connector: &mut Connector) {
        if let Some(source) = self.source_item_id {
            connector.source_item_id = source;
        }
        if let Some(target) = self.target_item_id {
            connector.target_item_id = target;
        }
        if let Some(style) = &self.style {
            connector.style = style.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_json_shape() {
        let json = r##"{
            "id": 7,
            "boardId": 1,
            "type": "sticky_note",
            "position": {"x": 10.0, "y": 20.0},
            "geometry": {"width": 200.0, "height": 200.0, "rotation": 0.0},
            "style": {"color": "#000", "fillColor": "#fff9b1", "fontSize": 14},
            "data": {"content": "hello", "shape": "round"},
            "parentId": null
        }"##;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, Some(7));
        assert_eq!(item.kind, ItemKind::StickyNote);
        assert_eq!(item.style.fill_color.as_deref(), Some("#fff9b1"));
        assert_eq!(item.style.extra.get("fontSize"), Some(&Value::from(14)));
        assert_eq!(item.data.content.as_deref(), Some("hello"));

        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["style"]["fontSize"], 14);
        assert_eq!(back["data"]["shape"], "round");
        assert_eq!(back["type"], "sticky_note");
    }

    #[test]
    fn test_pending_item_serializes_null_id() {
        let item = Item::pending(3, ItemKind::Circle, Position::new(0.0, 0.0));
        let json = serde_json::to_value(&item).unwrap();
        assert!(json["id"].is_null());
        assert!(json["clientRef"].is_string());
        assert_eq!(json["geometry"]["width"], 100.0);
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in ItemKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::from(kind.as_str()));
        }
    }

    #[test]
    fn test_patch_replaces_wholesale() {
        let mut item = Item::pending(1, ItemKind::Shape, Position::new(0.0, 0.0));
        item.style.extra.insert("borderWidth".into(), Value::from(2));

        let patch = ItemPatch {
            style: Some(ItemStyle { color: Some("#f00".into()), ..ItemStyle::default() }),
            ..ItemPatch::default()
        };
        patch.apply(&mut item);

        assert_eq!(item.style.color.as_deref(), Some("#f00"));
        assert!(item.style.fill_color.is_none());
        assert!(item.style.extra.is_empty());
    }

    #[test]
    fn test_patch_finite() {
        assert!(ItemPatch::position(1.0, 2.0).is_finite());
        assert!(!ItemPatch::position(f64::NAN, 2.0).is_finite());
        assert!(!ItemPatch::geometry(Geometry::new(f64::INFINITY, 1.0)).is_finite());
        assert!(ItemPatch::default().is_empty());
    }

    #[test]
    fn test_patch_detaches_parent() {
        let mut item = Item::pending(1, ItemKind::Card, Position::default());
        item.parent_id = Some(9);
        let patch = ItemPatch { parent_id: Some(None), ..ItemPatch::default() };
        patch.apply(&mut item);
        assert_eq!(item.parent_id, None);
    }
}
