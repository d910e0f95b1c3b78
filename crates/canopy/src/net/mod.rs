mod connection;
pub mod graph;
mod protocol;
mod transport;

pub use connection::{ConnectionState, ConnectionTable, PeerConnection, PeerId, PlayerRegistry};
pub use graph::GraphError;
pub use protocol::{
    DataType, DeltaUpdate, Envelope, FullSnapshot, ProtocolError, RpcCall, StructuralAdd,
    StructuralRemove, WireNode,
};
pub use transport::{
    Delivery, HubStats, LoopbackHub, LoopbackTransport, RecordingTransport, Route, Transport,
    TransportError,
};
