use crate::identity::UniqueId;
use crate::net::PeerId;
use crate::scene::EntityHandle;
use crate::value::CodecError;

/// Where an RPC goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcScope {
    ToAuthority,
    ToAllClients,
    ToOneClient(PeerId),
}

/// Ways dispatching an RPC can fail. All of them drop the call and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("caller identity {0} is unknown")]
    UnresolvedCaller(UniqueId),
    #[error("caller {0:?} has no replicated identity")]
    CallerHasNoIdentity(EntityHandle),
    #[error("caller {0:?} is local-only")]
    LocalOnlyCaller(EntityHandle),
    #[error("entity {0:?} is not in the tree")]
    UnknownEntity(EntityHandle),
    #[error("type `{0}` has no registered methods")]
    UnknownType(String),
    #[error("`{type_name}` has no method `{method}`")]
    UnknownMethod { type_name: String, method: String },
    #[error("`{method}` takes {expected} arguments, got {got}")]
    ArityMismatch {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("argument {index} should be {expected}, got {got}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },
    #[error("entity has no capability of the expected kind")]
    MissingCapability,
    #[error("argument encoding failed: {0}")]
    Codec(#[from] CodecError),
}

impl RpcError {
    pub(crate) fn argument(index: usize, expected: &'static str, got: &crate::value::Value) -> Self {
        Self::ArgumentType {
            index,
            expected,
            got: got.kind(),
        }
    }
}
