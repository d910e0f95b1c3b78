pub mod capability;
pub mod identity;
pub mod net;
pub mod registry;
pub mod replication;
pub mod rpc;
pub mod scene;
pub mod value;

pub use capability::{
    AuthorityPush, ButtonSync, NetworkData, Ownership, Payload, PayloadError, ReconcileSettings,
    StepContext, TransformSync2D, TransformSync3D, register_button, register_transform_2d,
    register_transform_3d,
};
pub use identity::{DEFAULT_LOCAL_ID_CEILING, IdentityError, IdentityRegistry, UniqueId};
pub use net::{
    ConnectionState, DataType, Envelope, LoopbackHub, LoopbackTransport, PeerId,
    RecordingTransport, Route, Transport, TransportError,
};
pub use registry::{RegistryError, RpcContext, TypeRegistry};
pub use replication::{
    DeferredOp, DeferredQueue, ReplicationConfig, ReplicationError, ReplicationEvent, Replicator,
    Role, StepClock,
};
pub use rpc::{RpcError, RpcScope};
pub use scene::{
    ControlLayout, Entity, EntityHandle, GroupFlags, SceneTree, Spatial, Subtree, Transform2D,
    Transform3D,
};
pub use value::{Value, WireValue};
