//! A small dependency resolver for handlers.
//!
//! Services are registered on a [`ServiceCollection`], frozen into a [`ServiceProvider`]
//! and resolved from a [`ServiceScope`]. Every delivery gets its own scope: scoped
//! services are shared by the handler arguments of one delivery and dropped with it.
//!
//! ```rust
//! use carrot_dispatch::services::ServiceCollection;
//! use std::sync::Arc;
//!
//! struct Clock;
//! struct RequestId(String);
//!
//! let mut services = ServiceCollection::new();
//! services
//!     .add_singleton(Arc::new(Clock))
//!     .add_scoped(|_| Ok(Arc::new(RequestId("abc".into()))));
//! let provider = services.build();
//!
//! let scope = provider.create_scope();
//! let first = scope.resolve::<RequestId>().unwrap();
//! let second = scope.resolve::<RequestId>().unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Always an `Arc<T>` behind the `Any`, so that unsized services (`dyn Trait`) work.
type AnyService = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceScope) -> Result<AnyService, anyhow::Error> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ServiceId {
    type_id: TypeId,
    key: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance for the whole provider.
    Singleton,
    /// One instance per scope (i.e. per delivery).
    Scoped,
    /// A new instance every time it is resolved.
    Transient,
}

#[derive(Clone)]
struct Registration {
    lifetime: Lifetime,
    factory: Factory,
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("No service registered for `{type_name}` (key: {key:?})")]
    NotRegistered {
        type_name: &'static str,
        key: Option<&'static str>,
    },
    #[error("Failed to construct `{type_name}`")]
    Construction {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Service registrations, before the provider is built.
#[derive(Default, Clone)]
pub struct ServiceCollection {
    registrations: HashMap<ServiceId, Registration>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing instance. Registering the same type twice replaces the first
    /// registration.
    pub fn add_singleton<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.register::<T, _>(None, Lifetime::Singleton, move |_| Ok(value.clone()))
    }

    pub fn add_keyed_singleton<T: ?Sized + Send + Sync + 'static>(
        &mut self,
        key: &'static str,
        value: Arc<T>,
    ) -> &mut Self {
        self.register::<T, _>(Some(key), Lifetime::Singleton, move |_| Ok(value.clone()))
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> Result<Arc<T>, anyhow::Error> + Send + Sync + 'static,
    {
        self.register(None, Lifetime::Scoped, factory)
    }

    pub fn add_keyed_scoped<T, F>(&mut self, key: &'static str, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> Result<Arc<T>, anyhow::Error> + Send + Sync + 'static,
    {
        self.register(Some(key), Lifetime::Scoped, factory)
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> Result<Arc<T>, anyhow::Error> + Send + Sync + 'static,
    {
        self.register(None, Lifetime::Transient, factory)
    }

    pub fn add_keyed_transient<T, F>(&mut self, key: &'static str, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> Result<Arc<T>, anyhow::Error> + Send + Sync + 'static,
    {
        self.register(Some(key), Lifetime::Transient, factory)
    }

    fn register<T, F>(
        &mut self,
        key: Option<&'static str>,
        lifetime: Lifetime,
        factory: F,
    ) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceScope) -> Result<Arc<T>, anyhow::Error> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |scope: &ServiceScope| {
            let service = factory(scope)?;
            Ok(Arc::new(service) as AnyService)
        });
        self.registrations.insert(
            ServiceId {
                type_id: TypeId::of::<T>(),
                key,
            },
            Registration { lifetime, factory },
        );
        self
    }

    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            inner: Arc::new(ProviderInner {
                registrations: self.registrations,
                singletons: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct ProviderInner {
    registrations: HashMap<ServiceId, Registration>,
    singletons: Mutex<HashMap<ServiceId, AnyService>>,
}

/// Frozen registrations plus the singleton instances created so far.
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ProviderInner>,
}

impl Default for ServiceProvider {
    fn default() -> Self {
        ServiceCollection::new().build()
    }
}

impl ServiceProvider {
    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope {
            provider: self.inner.clone(),
            scoped: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn lifetime_of<T: ?Sized + 'static>(&self, key: Option<&'static str>) -> Option<Lifetime> {
        self.inner
            .registrations
            .get(&ServiceId {
                type_id: TypeId::of::<T>(),
                key,
            })
            .map(|r| r.lifetime)
    }
}

/// Resolves services for the duration of one delivery.
///
/// Clones share the same scoped instances.
#[derive(Clone)]
pub struct ServiceScope {
    provider: Arc<ProviderInner>,
    scoped: Arc<Mutex<HashMap<ServiceId, AnyService>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceScope {
    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ServiceError> {
        self.resolve_with_key(None)
    }

    pub fn resolve_keyed<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: &'static str,
    ) -> Result<Arc<T>, ServiceError> {
        self.resolve_with_key(Some(key))
    }

    fn resolve_with_key<T: ?Sized + Send + Sync + 'static>(
        &self,
        key: Option<&'static str>,
    ) -> Result<Arc<T>, ServiceError> {
        let type_name = std::any::type_name::<T>();
        let id = ServiceId {
            type_id: TypeId::of::<T>(),
            key,
        };
        let service = self.resolve_any(id, type_name)?;
        service
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(ServiceError::NotRegistered { type_name, key })
    }

    fn resolve_any(
        &self,
        id: ServiceId,
        type_name: &'static str,
    ) -> Result<AnyService, ServiceError> {
        let registration = self
            .provider
            .registrations
            .get(&id)
            .ok_or(ServiceError::NotRegistered {
                type_name,
                key: id.key,
            })?;
        let cache = match registration.lifetime {
            Lifetime::Singleton => Some(&self.provider.singletons),
            Lifetime::Scoped => Some(&*self.scoped),
            Lifetime::Transient => None,
        };
        if let Some(existing) = cache.and_then(|c| lock(c).get(&id).cloned()) {
            return Ok(existing);
        }
        // The lock is not held while the factory runs: factories resolve their own
        // dependencies from this scope.
        let created = (registration.factory)(self)
            .map_err(|source| ServiceError::Construction { type_name, source })?;
        Ok(match cache {
            Some(cache) => lock(cache).entry(id).or_insert(created).clone(),
            None => created,
        })
    }
}
