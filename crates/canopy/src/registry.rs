use std::collections::HashMap;
use std::fmt;

use crate::capability::NetworkData;
use crate::net::PeerId;
use crate::replication::DeferredQueue;
use crate::rpc::RpcError;
use crate::scene::{Entity, EntityHandle, SceneTree};
use crate::value::Value;

pub type CapabilityFactory = Box<dyn Fn() -> Box<dyn NetworkData>>;
pub type MethodHandler = Box<dyn Fn(&mut RpcContext<'_>, &[Value]) -> Result<(), RpcError>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("type `{0}` is already registered")]
    DuplicateType(String),
    #[error("type `{0}` already has a capability factory")]
    DuplicateCapability(String),
    #[error("type `{0}` is not registered")]
    UnknownType(String),
    #[error("`{type_name}` already has a method `{method}`")]
    DuplicateMethod { type_name: String, method: String },
}

/// What a method handler gets to touch.
pub struct RpcContext<'a> {
    pub handle: EntityHandle,
    pub entity: &'a mut Entity,
    pub capability: Option<&'a mut (dyn NetworkData + 'static)>,
    /// Peer the call came from; `None` for in-process calls.
    pub sender: Option<PeerId>,
    /// Structural changes must go through here.
    pub deferred: &'a mut DeferredQueue,
}

impl RpcContext<'_> {
    pub fn capability_mut<T: NetworkData>(&mut self) -> Result<&mut T, RpcError> {
        self.capability
            .as_deref_mut()
            .and_then(|capability| capability.downcast_mut::<T>())
            .ok_or(RpcError::MissingCapability)
    }

    /// The host entity alongside its capability.
    pub fn entity_and_capability<T: NetworkData>(&mut self) -> Result<(&Entity, &mut T), RpcError> {
        let capability = self
            .capability
            .as_deref_mut()
            .and_then(|capability| capability.downcast_mut::<T>())
            .ok_or(RpcError::MissingCapability)?;
        Ok((&*self.entity, capability))
    }
}

struct Method {
    arity: usize,
    handler: MethodHandler,
}

#[derive(Default)]
struct TypeEntry {
    factory: Option<CapabilityFactory>,
    methods: HashMap<String, Method>,
}

/// Declared entity type to capability factory and RPC methods.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<String, TypeEntry>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, type_name: impl Into<String>) -> Result<(), RegistryError> {
        let type_name = type_name.into();
        if self.types.contains_key(&type_name) {
            return Err(RegistryError::DuplicateType(type_name));
        }
        self.types.insert(type_name, TypeEntry::default());
        Ok(())
    }

    /// Registers the type if needed and sets the capability its entities carry.
    pub fn register_capability<F>(
        &mut self,
        type_name: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn NetworkData> + 'static,
    {
        let type_name = type_name.into();
        let entry = self.types.entry(type_name.clone()).or_default();
        if entry.factory.is_some() {
            return Err(RegistryError::DuplicateCapability(type_name));
        }
        entry.factory = Some(Box::new(factory));
        Ok(())
    }

    pub fn register_method<F>(
        &mut self,
        type_name: &str,
        method: impl Into<String>,
        arity: usize,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&mut RpcContext<'_>, &[Value]) -> Result<(), RpcError> + 'static,
    {
        let entry = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_owned()))?;
        let method = method.into();
        if entry.methods.contains_key(&method) {
            return Err(RegistryError::DuplicateMethod {
                type_name: type_name.to_owned(),
                method,
            });
        }
        entry.methods.insert(
            method,
            Method {
                arity,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn has_method(&self, type_name: &str, method: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|entry| entry.methods.contains_key(method))
    }

    pub fn instantiate(&self, type_name: &str) -> Option<Box<dyn NetworkData>> {
        self.types
            .get(type_name)
            .and_then(|entry| entry.factory.as_ref())
            .map(|factory| factory())
    }

    /// Runs the handler registered for the target's declared type. Arity is
    /// checked before the handler sees the arguments.
    pub fn invoke(
        &self,
        tree: &mut SceneTree,
        deferred: &mut DeferredQueue,
        target: EntityHandle,
        method: &str,
        args: &[Value],
        sender: Option<PeerId>,
    ) -> Result<(), RpcError> {
        let type_name = tree
            .get(target)
            .map(|entity| entity.type_name.clone())
            .ok_or(RpcError::UnknownEntity(target))?;
        let entry = self
            .types
            .get(&type_name)
            .ok_or_else(|| RpcError::UnknownType(type_name.clone()))?;
        let registered = entry
            .methods
            .get(method)
            .ok_or_else(|| RpcError::UnknownMethod {
                type_name: type_name.clone(),
                method: method.to_owned(),
            })?;
        if registered.arity != args.len() {
            return Err(RpcError::ArityMismatch {
                method: method.to_owned(),
                expected: registered.arity,
                got: args.len(),
            });
        }

        let (entity, capability) = tree
            .entity_with_capability_mut(target)
            .ok_or(RpcError::UnknownEntity(target))?;
        let mut ctx = RpcContext {
            handle: target,
            entity,
            capability,
            sender,
            deferred,
        };
        (registered.handler)(&mut ctx, args)
    }
}
