//! BoardLink Core Library
//!
//! Real-time synchronization of collaborative whiteboards: the board data
//! model, the topic wire protocol, a reconnecting transport, the client-side
//! store, throttled drag publishing, error reporting and connector geometry.

pub mod config;
pub mod errors;
pub mod geometry;
pub mod model;
pub mod protocol;
pub mod session;
pub mod store;
pub mod throttle;
pub mod transport;

pub use config::SyncConfig;
pub use errors::{ErrorChannel, ErrorEvent, ErrorKind, SyncError, classify, is_permission_error};
pub use geometry::{BoundingBox, ConnectorEndpoints, Side, connector_curve, connector_endpoints, intersection, side};
pub use model::{
    BoardId, Connector, ConnectorId, ConnectorPatch, Geometry, Item, ItemId, ItemKind, ItemPatch, Position,
};
pub use protocol::{BoardEvent, ClientFrame, Destination, InitialData, ServerFrame};
pub use session::{BoardSession, SessionEvent};
pub use store::{BoardStore, StoreChange};
pub use throttle::Throttle;
pub use transport::{
    Connection, ConnectionState, MemoryConnection, NativeWebSocket, TransportAdapter, TransportError,
};
