//! Connector routing between item bounding boxes.
//!
//! All functions are pure. Endpoints must be recomputed whenever either item
//! moves or resizes; nothing here caches.
//!
//! Item rotation is not taken into account: a rotated item is routed as if it
//! were axis-aligned, and the rotation is applied visually afterwards.

use kurbo::{CubicBez, Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

use crate::model::Item;

/// Pixel tolerance used when classifying a boundary point against an edge.
pub const SIDE_TOLERANCE: f64 = 1.0;

/// Default curvature for connector curves.
pub const DEFAULT_CURVATURE: f64 = 0.25;

/// Axis-aligned box described by its center and half-extents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub center: Point,
    pub half_extents: Vec2,
}

impl BoundingBox {
    /// Box centered on `center` with the given full width and height.
    pub fn new(center: Point, width: f64, height: f64) -> Self {
        Self {
            center,
            half_extents: Vec2::new(width / 2.0, height / 2.0),
        }
    }

    /// Bounding box of an item. Item positions are centers.
    pub fn from_item(item: &Item) -> Self {
        Self::new(item.position.into(), item.geometry.width, item.geometry.height)
    }

    pub fn width(&self) -> f64 {
        self.half_extents.x * 2.0
    }

    pub fn height(&self) -> f64 {
        self.half_extents.y * 2.0
    }

    pub fn rect(&self) -> Rect {
        Rect::from_center_size(self.center, (self.width(), self.height()))
    }

    fn is_degenerate(&self) -> bool {
        !(self.half_extents.x > 0.0 && self.half_extents.y > 0.0)
    }
}

/// Edge of a box a connector attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Top,
    Bottom,
}

/// Attachment points and sides of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorEndpoints {
    pub sx: f64,
    pub sy: f64,
    pub tx: f64,
    pub ty: f64,
    pub source_side: Side,
    pub target_side: Side,
}

impl ConnectorEndpoints {
    pub fn source(&self) -> Point {
        Point::new(self.sx, self.sy)
    }

    pub fn target(&self) -> Point {
        Point::new(self.tx, self.ty)
    }
}

/// Point where the ray from `a`'s center toward `b`'s center leaves `a`.
///
/// The direction is scaled into `a`'s local units, rotated by 45 degrees and
/// L1-normalized there, then rotated back. In the rotated frame the L1 unit
/// ball is the box itself, so the result lies exactly on `a`'s boundary.
///
/// Returns `a`'s center when the centers coincide or `a` has no area.
pub fn intersection(a: &BoundingBox, b: &BoundingBox) -> Point {
    let d = b.center - a.center;
    if a.is_degenerate() || (d.x == 0.0 && d.y == 0.0) {
        return a.center;
    }

    let w = a.half_extents.x;
    let h = a.half_extents.y;

    let xx1 = d.x / (2.0 * w) - d.y / (2.0 * h);
    let yy1 = d.x / (2.0 * w) + d.y / (2.0 * h);
    let scale = 1.0 / (xx1.abs() + yy1.abs());
    let xx3 = scale * xx1;
    let yy3 = scale * yy1;

    Point::new(w * (xx3 + yy3) + a.center.x, h * (-xx3 + yy3) + a.center.y)
}

/// Classify a boundary point against the edges of `bbox`.
///
/// Edges are tested Left, Right, Top, Bottom in that order, each with
/// [`SIDE_TOLERANCE`] after rounding to whole pixels. A point matching none of
/// them (e.g. the center) is reported as Top.
pub fn side(bbox: &BoundingBox, point: Point) -> Side {
    let rect = bbox.rect();
    let nx = rect.x0.round();
    let ny = rect.y0.round();
    let px = point.x.round();
    let py = point.y.round();

    if px <= nx + SIDE_TOLERANCE {
        Side::Left
    } else if px >= nx + bbox.width() - SIDE_TOLERANCE {
        Side::Right
    } else if py <= ny + SIDE_TOLERANCE {
        Side::Top
    } else if py >= ny + bbox.height() - SIDE_TOLERANCE {
        Side::Bottom
    } else {
        Side::Top
    }
}

/// Attachment points of a connector from `source` to `target`.
pub fn connector_endpoints(source: &BoundingBox, target: &BoundingBox) -> ConnectorEndpoints {
    let s = intersection(source, target);
    let t = intersection(target, source);
    ConnectorEndpoints {
        sx: s.x,
        sy: s.y,
        tx: t.x,
        ty: t.y,
        source_side: side(source, s),
        target_side: side(target, t),
    }
}

fn control_offset(distance: f64, curvature: f64) -> f64 {
    if distance >= 0.0 {
        0.5 * distance
    } else {
        curvature * 25.0 * (-distance).sqrt()
    }
}

fn control_point(side: Side, from: Point, to: Point, curvature: f64) -> Point {
    match side {
        Side::Left => Point::new(from.x - control_offset(from.x - to.x, curvature), from.y),
        Side::Right => Point::new(from.x + control_offset(to.x - from.x, curvature), from.y),
        Side::Top => Point::new(from.x, from.y - control_offset(from.y - to.y, curvature)),
        Side::Bottom => Point::new(from.x, from.y + control_offset(to.y - from.y, curvature)),
    }
}

/// Cubic curve through both endpoints, leaving each one perpendicular to its side.
pub fn connector_curve(endpoints: &ConnectorEndpoints, curvature: f64) -> CubicBez {
    let source = endpoints.source();
    let target = endpoints.target();
    CubicBez::new(
        source,
        control_point(endpoints.source_side, source, target, curvature),
        control_point(endpoints.target_side, target, source, curvature),
        target,
    )
}
