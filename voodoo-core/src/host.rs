//! Host: identifier allocator, method registry, interface registry and dispatch.
//!
//! `C` is the per-call context handed to every handler (the server passes the
//! connection being served). Handlers are cloned out of the registry before they
//! run, so a handler may register or unregister entries, including itself.

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::id::{Id, IdAllocator, IdError};
use crate::value::{FromValue, Value};

/// Registered method body: arguments in, result values out.
pub type Handler<C> = Arc<dyn Fn(&C, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync>;

type InterfaceRef = Arc<dyn Any + Send + Sync>;

/// Error raised by registry operations or by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("out of id space")]
    IdSpaceExhausted,
    #[error("invalid method id {0}")]
    UnknownMethod(Id),
    #[error("invalid interface id {0}")]
    UnknownInterface(Id),
    #[error("interface {id} is not a {expected}")]
    InterfaceType { id: Id, expected: &'static str },
    #[error("missing argument {index}")]
    MissingArgument { index: usize },
    #[error("argument {index}: expected {expected}, got {found}")]
    BadArgument {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown method tag {0}")]
    UnknownMethodTag(i32),
    #[error("{0}")]
    Failed(String),
}

impl From<IdError> for HostError {
    fn from(_: IdError) -> Self {
        HostError::IdSpaceExhausted
    }
}

/// Typed argument at `index`.
pub fn arg<T: FromValue>(args: &[Value], index: usize) -> Result<T, HostError> {
    let value = args
        .get(index)
        .ok_or(HostError::MissingArgument { index })?;
    T::from_value(value).ok_or(HostError::BadArgument {
        index,
        expected: T::EXPECTED,
        found: value.type_name(),
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Host<C> {
    ids: IdAllocator,
    methods: Mutex<BTreeMap<Id, Handler<C>>>,
    interfaces: Mutex<BTreeMap<Id, InterfaceRef>>,
}

impl<C> Default for Host<C> {
    fn default() -> Self {
        Self {
            ids: IdAllocator::new(),
            methods: Mutex::new(BTreeMap::new()),
            interfaces: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<C> Host<C> {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_ids(ids: IdAllocator) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Register a handler under a fresh identifier.
    pub fn register<F>(&self, handler: F) -> Result<Id, HostError>
    where
        F: Fn(&C, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync + 'static,
    {
        self.register_with(|_| handler)
    }

    /// Like `register`, but the handler is built from its own identifier.
    pub fn register_with<F, H>(&self, make: F) -> Result<Id, HostError>
    where
        F: FnOnce(Id) -> H,
        H: Fn(&C, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync + 'static,
    {
        let id = self.ids.allocate().map_err(|e| {
            tracing::error!("method registration failed: {e}");
            HostError::from(e)
        })?;
        let handler: Handler<C> = Arc::new(make(id));
        lock(&self.methods).insert(id, handler);
        Ok(id)
    }

    pub fn unregister(&self, id: Id) -> Result<(), HostError> {
        let removed = lock(&self.methods).remove(&id);
        match removed {
            Some(_) => Ok(()),
            None => Err(HostError::UnknownMethod(id)),
        }
    }

    pub fn is_registered(&self, id: Id) -> bool {
        lock(&self.methods).contains_key(&id)
    }

    /// Store `object` under `id`. The registry becomes its owner; a previous
    /// entry under the same id is replaced.
    pub fn register_interface<T: Any + Send + Sync>(&self, id: Id, object: Arc<T>) {
        let previous = lock(&self.interfaces).insert(id, object);
        drop(previous);
    }

    /// Remove the entry and hand back ownership of the object.
    pub fn unregister_interface(&self, id: Id) -> Result<Arc<dyn Any + Send + Sync>, HostError> {
        let removed = lock(&self.interfaces).remove(&id);
        removed.ok_or(HostError::UnknownInterface(id))
    }

    /// Resolve an identifier found in an argument list to the concrete object.
    pub fn lookup_interface<T: Any + Send + Sync>(&self, id: Id) -> Result<Arc<T>, HostError> {
        let entry = lock(&self.interfaces)
            .get(&id)
            .cloned()
            .ok_or(HostError::UnknownInterface(id))?;
        entry.downcast::<T>().map_err(|_| HostError::InterfaceType {
            id,
            expected: type_name::<T>(),
        })
    }

    pub fn method_count(&self) -> usize {
        lock(&self.methods).len()
    }

    pub fn interface_count(&self) -> usize {
        lock(&self.interfaces).len()
    }

    /// Dispatch one call. The registry lock is released before the handler runs.
    pub fn handle(&self, ctx: &C, id: Id, args: &[Value]) -> Result<Vec<Value>, HostError> {
        let handler = lock(&self.methods)
            .get(&id)
            .cloned()
            .ok_or(HostError::UnknownMethod(id))?;
        handler(ctx, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    fn adder(host: &Host<()>) -> Id {
        host.register(|_, args| {
            let a: i32 = arg(args, 0)?;
            let b: i32 = arg(args, 1)?;
            Ok(values![a + b])
        })
        .unwrap()
    }

    #[test]
    fn register_ids_increase() {
        let host = Host::<()>::new();
        let a = adder(&host);
        let b = adder(&host);
        let c = adder(&host);
        assert!(a.is_valid());
        assert!(a < b && b < c);
        assert_eq!(host.method_count(), 3);
    }

    #[test]
    fn handle_dispatches() {
        let host = Host::<()>::new();
        let id = adder(&host);
        assert_eq!(host.handle(&(), id, &values![3i32, 5i32]).unwrap(), values![8i32]);
        assert!(matches!(
            host.handle(&(), id, &values![3i32, 5u32]),
            Err(HostError::BadArgument { index: 1, expected: "i32", found: "u32" })
        ));
    }

    #[test]
    fn exhausted_ids_fail_registration() {
        let host = Host::<()>::with_ids(IdAllocator::starting_after(u64::MAX - 1));
        assert!(adder(&host).is_valid());
        assert_eq!(
            host.register(|_, _| Ok(vec![])),
            Err(HostError::IdSpaceExhausted)
        );
        assert_eq!(
            host.register_with(|_| {
                |_: &(), _: &[Value]| -> Result<Vec<Value>, HostError> { Ok(vec![]) }
            }),
            Err(HostError::IdSpaceExhausted)
        );
        assert_eq!(host.method_count(), 1);
    }

    #[test]
    fn unregister_then_handle_is_unknown() {
        let host = Host::<()>::new();
        let id = adder(&host);
        host.unregister(id).unwrap();
        assert_eq!(
            host.handle(&(), id, &values![1i32, 2i32]),
            Err(HostError::UnknownMethod(id))
        );
        assert_eq!(host.unregister(id), Err(HostError::UnknownMethod(id)));
        // Removed ids are not recycled.
        assert!(adder(&host) > id);
    }

    #[test]
    fn interfaces_lookup_and_remove() {
        let host = Host::<()>::new();
        let id = Id::new(42);
        host.register_interface(id, Arc::new(String::from("image")));
        assert_eq!(*host.lookup_interface::<String>(id).unwrap(), "image");
        assert!(matches!(
            host.lookup_interface::<u32>(id),
            Err(HostError::InterfaceType { .. })
        ));
        host.unregister_interface(id).unwrap();
        assert_eq!(
            host.lookup_interface::<String>(id).unwrap_err(),
            HostError::UnknownInterface(id)
        );
        assert!(matches!(
            host.unregister_interface(id),
            Err(HostError::UnknownInterface(_))
        ));
    }

    #[test]
    fn handler_can_register_and_remove_itself() {
        let host = Arc::new(Host::<()>::new());
        let weak = Arc::downgrade(&host);
        let id = host
            .register_with(move |own_id| {
                move |_: &(), _: &[Value]| -> Result<Vec<Value>, HostError> {
                    let host = weak.upgrade().ok_or(HostError::UnknownMethod(own_id))?;
                    let child = host.register(|_, _| Ok(vec![]))?;
                    host.unregister(own_id)?;
                    Ok(values![child])
                }
            })
            .unwrap();
        let out = host.handle(&(), id, &[]).unwrap();
        let Value::Id(child) = out[0] else {
            panic!("expected id, got {:?}", out);
        };
        assert!(host.is_registered(child));
        assert!(!host.is_registered(id));
    }
}
