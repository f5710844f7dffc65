//! Remote objects (server side) and proxies (client side).
//!
//! A published object is one method entry, one interface entry and one cleanup
//! entry sharing an identifier. It goes away either on RELEASE or when the
//! connection that created it is lost; whichever comes first disarms the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use voodoo_core::{Host, HostError, Id, Invocation, MethodTag, Value};

use crate::client::{Client, ClientError};
use crate::context::{CallContext, CleanupScope};

/// Server-side implementation of one interface.
pub trait Interface: Send + Sync + 'static {
    type Method: MethodTag;

    /// Serve `method`. `args[0]` is the method tag; real arguments start at 1.
    fn call(
        &self,
        ctx: &CallContext,
        method: Self::Method,
        args: &[Value],
    ) -> Result<Vec<Value>, HostError>;

    /// Runs once when the object is torn down, by release or disconnect.
    fn on_release(&self) {}
}

struct Lifetime {
    host: Weak<Host<CallContext>>,
    scope: CleanupScope,
    released: AtomicBool,
}

impl Lifetime {
    fn teardown<T: Interface>(&self, id: Id, object: &T) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            if let Err(e) = host.unregister(id) {
                tracing::warn!(object = %id, "teardown: {e}");
            }
            // The registry's reference drops here; `object` is still borrowed
            // from the caller's own handle.
            if let Err(e) = host.unregister_interface(id) {
                tracing::warn!(object = %id, "teardown: {e}");
            }
        }
        object.on_release();
    }
}

/// Publish `object` on `host` and tie its lifetime to the connection in `ctx`.
/// Returns the identifier to hand back to the caller.
///
/// The interface registry is the only strong owner; the dispatch entry and the
/// cleanup action hold the object weakly.
pub fn publish<T: Interface>(
    host: &Arc<Host<CallContext>>,
    ctx: &CallContext,
    object: T,
) -> Result<Id, HostError> {
    let object = Arc::new(object);
    let lifetime = Arc::new(Lifetime {
        host: Arc::downgrade(host),
        scope: ctx.cleanup_scope(),
        released: AtomicBool::new(false),
    });

    let weak = Arc::downgrade(&object);
    let dispatch_lifetime = lifetime.clone();
    let id = host.register_with(move |id| {
        move |ctx: &CallContext, args: &[Value]| -> Result<Vec<Value>, HostError> {
            let object = weak.upgrade().ok_or(HostError::UnknownInterface(id))?;
            match Invocation::<T::Method>::parse(args)? {
                Invocation::Release => {
                    tracing::debug!(
                        object = %id,
                        conn = %ctx.connection(),
                        owner = %dispatch_lifetime.scope.connection(),
                        "release"
                    );
                    dispatch_lifetime.scope.remove(id);
                    dispatch_lifetime.teardown(id, &*object);
                    Ok(vec![])
                }
                Invocation::Method(method) => object.call(ctx, method, args),
            }
        }
    })?;

    let weak = Arc::downgrade(&object);
    host.register_interface(id, object);
    ctx.push_cleanup(id, move || {
        if let Some(object) = weak.upgrade() {
            lifetime.teardown(id, &*object);
        }
    });
    Ok(id)
}

/// Client-side handle to a remote object. Dropping it sends RELEASE.
pub struct Proxy {
    client: Client,
    id: Id,
}

impl Proxy {
    pub fn new(client: &Client, id: Id) -> Self {
        Self {
            client: client.clone(),
            id,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Call `method` on the remote object.
    pub async fn invoke<M: MethodTag>(
        &self,
        method: M,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ClientError> {
        self.client.call(self.id, with_tag(method, args)).await
    }

    /// Call `method` with a trailing raw byte buffer.
    pub async fn invoke_with_buffer<M: MethodTag>(
        &self,
        method: M,
        buffer: impl Into<Vec<u8>>,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ClientError> {
        self.client
            .call2(self.id, buffer, with_tag(method, args))
            .await
    }
}

fn with_tag<M: MethodTag>(method: M, args: Vec<Value>) -> Vec<Value> {
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(Value::I32(method.tag()));
    full.extend(args);
    full
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if !self.id.is_valid() {
            return;
        }
        if let Err(e) = self.client.release(self.id) {
            tracing::debug!(object = %self.id, "release not sent: {e}");
        }
    }
}
