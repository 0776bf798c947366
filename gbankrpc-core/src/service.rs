//! Handler registration and dispatch.
//!
//! The original Go implementation builds its dispatch table with runtime
//! reflection: it enumerates a handler's exported methods, checks their
//! signature shape, and stores a `(argType, replyType)` pair per method.
//! Rust has no runtime reflection, so this module takes the idiomatic
//! substitute the design notes call out: a builder API the user drives
//! explicitly, which records a type-erased `(decode, invoke, encode)`
//! closure per method at registration time instead of discovering methods
//! by inspecting a value at runtime.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::CodecId;
use crate::error::{Result, RpcError};

/// A single registered method: decodes its argument, invokes the handler,
/// and encodes the reply, all without the caller needing to know `Arg` or
/// `Reply`.
#[async_trait]
pub trait ErasedMethod: Send + Sync {
    async fn invoke(&self, codec: CodecId, arg_bytes: &[u8]) -> Result<Vec<u8>>;
    fn name(&self) -> &str;
    fn arg_type(&self) -> &'static str;
    fn reply_type(&self) -> &'static str;
    fn call_count(&self) -> u64;
}

struct TypedMethod<H, Arg, Reply, F, Fut> {
    name: String,
    handler: Arc<H>,
    f: F,
    calls: AtomicU64,
    _marker: PhantomData<fn(Arg, Reply) -> Fut>,
}

#[async_trait]
impl<H, Arg, Reply, F, Fut> ErasedMethod for TypedMethod<H, Arg, Reply, F, Fut>
where
    H: Send + Sync + 'static,
    Arg: DeserializeOwned + Send + 'static,
    Reply: Serialize + Default + Send + 'static,
    F: Fn(Arc<H>, Arg) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Reply, String>> + Send + 'static,
{
    async fn invoke(&self, codec: CodecId, arg_bytes: &[u8]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let arg: Arg = crate::codec::decode(codec, arg_bytes)?;
        let reply = (self.f)(Arc::clone(&self.handler), arg)
            .await
            .map_err(RpcError::User)?;
        crate::codec::encode(codec, &reply)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arg_type(&self) -> &'static str {
        std::any::type_name::<Arg>()
    }

    fn reply_type(&self) -> &'static str {
        std::any::type_name::<Reply>()
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// A handler's immutable, shared dispatch table, built once at registration.
pub struct ServiceEntry {
    pub name: String,
    methods: HashMap<String, Arc<dyn ErasedMethod>>,
}

impl ServiceEntry {
    pub fn method(&self, name: &str) -> Option<&Arc<dyn ErasedMethod>> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<dyn ErasedMethod>> {
        self.methods.values()
    }
}

/// Builds a [`ServiceEntry`] from a handler instance and a set of named
/// methods with signature `async fn(Arc<H>, Arg) -> Result<Reply, String>`.
///
/// This is the registration-time replacement for the Go eligibility rule
/// (exported name, exactly `(arg, *reply) -> error`, reply is a pointer,
/// arg/reply are exported or built-in): each `.method()` call only compiles
/// if `Arg: DeserializeOwned` and `Reply: Serialize + Default`, so the
/// eligibility check happens once, at compile time, rather than once per
/// registered handler at runtime.
pub struct ServiceBuilder<H> {
    name: String,
    handler: Arc<H>,
    methods: HashMap<String, Arc<dyn ErasedMethod>>,
}

impl<H: Send + Sync + 'static> ServiceBuilder<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        ServiceBuilder {
            name: name.into(),
            handler: Arc::new(handler),
            methods: HashMap::new(),
        }
    }

    pub fn method<Arg, Reply, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        Reply: Serialize + Default + Send + 'static,
        F: Fn(Arc<H>, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Reply, String>> + Send + 'static,
    {
        let name = name.into();
        let entry = TypedMethod {
            name: name.clone(),
            handler: Arc::clone(&self.handler),
            f,
            calls: AtomicU64::new(0),
            _marker: PhantomData,
        };
        self.methods.insert(name, Arc::new(entry));
        self
    }

    pub fn build(self) -> ServiceEntry {
        ServiceEntry {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// The server's table of registered services, keyed by name. Shared
/// read-only across dispatch tasks once a service is registered.
#[derive(Default)]
pub struct ServiceTable {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        ServiceTable::default()
    }

    pub fn register(&self, entry: ServiceEntry) -> Result<()> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(&entry.name) {
            return Err(RpcError::Protocol(format!(
                "rpc: service already defined: {}",
                entry.name
            )));
        }
        services.insert(entry.name.clone(), Arc::new(entry));
        Ok(())
    }

    /// Splits `"Service.Method"` on the last `.` and resolves both halves.
    pub fn lookup(&self, service_method: &str) -> Result<(Arc<ServiceEntry>, Arc<dyn ErasedMethod>)> {
        let dot = service_method.rfind('.').ok_or_else(|| {
            RpcError::Protocol(format!(
                "rpc server: service/method request ill-formed: {service_method}"
            ))
        })?;
        let (service_name, method_name) = service_method.split_at(dot);
        let method_name = &method_name[1..];

        let services = self.services.read().unwrap();
        let service = services.get(service_name).ok_or_else(|| {
            RpcError::Protocol(format!("rpc server: can't find service {service_name}"))
        })?;
        let method = service.method(method_name).cloned().ok_or_else(|| {
            RpcError::Protocol(format!("rpc server: can't find Method {method_name}"))
        })?;
        Ok((Arc::clone(service), method))
    }

    pub fn services(&self) -> Vec<Arc<ServiceEntry>> {
        self.services.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Foo;

    #[derive(Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    #[derive(Serialize, Default)]
    struct Reply(i64);

    fn foo_service() -> ServiceEntry {
        ServiceBuilder::new("Foo", Foo)
            .method("Sum", |_h: Arc<Foo>, arg: Args| async move {
                Ok::<_, String>(Reply(arg.num1 + arg.num2))
            })
            .build()
    }

    #[tokio::test]
    async fn lookup_resolves_registered_method() {
        let table = ServiceTable::new();
        table.register(foo_service()).unwrap();

        let (_svc, method) = table.lookup("Foo.Sum").unwrap();
        let arg_bytes = crate::codec::encode(CodecId::Json, &Args { num1: 2, num2: 3 }).unwrap();
        let reply_bytes = method.invoke(CodecId::Json, &arg_bytes).await.unwrap();
        let reply: Reply = crate::codec::decode(CodecId::Json, &reply_bytes).unwrap();
        assert_eq!(reply.0, 5);
        assert_eq!(method.call_count(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = ServiceTable::new();
        table.register(foo_service()).unwrap();
        let err = table.register(foo_service());
        assert!(matches!(err, Err(RpcError::Protocol(_))));
    }

    #[test]
    fn ill_formed_name_is_rejected() {
        let table = ServiceTable::new();
        let err = table.lookup("NoDot");
        assert!(matches!(err, Err(RpcError::Protocol(_))));
    }

    #[test]
    fn unknown_service_is_rejected() {
        let table = ServiceTable::new();
        table.register(foo_service()).unwrap();
        let err = table.lookup("Bar.Sum");
        assert!(matches!(err, Err(RpcError::Protocol(_))));
    }

    #[test]
    fn unknown_method_message_matches_expected_substring() {
        let table = ServiceTable::new();
        table.register(foo_service()).unwrap();
        let err = table.lookup("Foo.Missing").unwrap_err();
        assert!(err.to_string().contains("can't find Method"));
    }
}
