//! Backend registry and API selection.
//!
//! Maps each [`Api`] to a factory producing its [`Backend`]. A registry is
//! assembled once with [`RegistryBuilder`] and is read-only afterwards.
//! Backends are created lazily on first [`BackendRegistry::resolve`] and
//! shared by every later caller.

use crate::backend::{Backend, DummyBackend, LoopbackBackend};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use unimidi_core::{Api, Error, Result};

/// Function that constructs a backend instance.
pub type BackendFactory = Arc<dyn Fn() -> Result<Arc<dyn Backend>> + Send + Sync>;

#[derive(Default)]
pub struct RegistryBuilder {
    factories: HashMap<Api, BackendFactory>,
}

impl RegistryBuilder {
    /// Registers a factory for `api`, replacing any earlier one.
    pub fn register<F>(mut self, api: Api, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(api, Arc::new(factory));
        self
    }

    /// Registers an existing backend under its own [`Backend::api`].
    pub fn register_instance(self, backend: Arc<dyn Backend>) -> Self {
        let api = backend.api();
        self.register(api, move || Ok(Arc::clone(&backend)))
    }

    /// Adds the backends built into this crate.
    pub fn with_defaults(self) -> Self {
        let builder = self
            .register(Api::Dummy, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
            .register(Api::Loopback, || {
                Ok(Arc::new(LoopbackBackend::new()) as Arc<dyn Backend>)
            });

        #[cfg(feature = "midi-io")]
        let builder = match Api::native_midi1() {
            Some(api) => builder.register(api, || {
                Ok(Arc::new(crate::backend::MidirBackend::new()?) as Arc<dyn Backend>)
            }),
            None => builder,
        };

        builder
    }

    pub fn build(self) -> Result<BackendRegistry> {
        if self.factories.contains_key(&Api::Default) {
            return Err(Error::InvalidConfig(
                "'default' is an alias and cannot be registered".to_string(),
            ));
        }
        Ok(BackendRegistry {
            factories: self.factories,
            instances: DashMap::new(),
        })
    }
}

pub struct BackendRegistry {
    factories: HashMap<Api, BackendFactory>,
    instances: DashMap<Api, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry holding the built-in backends.
    pub fn with_defaults() -> Self {
        Self {
            factories: RegistryBuilder::default().with_defaults().factories,
            instances: DashMap::new(),
        }
    }

    /// Backend for `api`. [`Api::Default`] resolves through [`Self::default_api`].
    pub fn resolve(&self, api: Api) -> Result<Arc<dyn Backend>> {
        let api = match api {
            Api::Default => self.default_api(),
            api => api,
        };
        let factory = self
            .factories
            .get(&api)
            .ok_or_else(|| Error::UnknownApi(api.name().to_string()))?;

        let entry = self.instances.entry(api).or_try_insert_with(|| {
            debug!("Creating MIDI backend {}", api);
            factory()
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Resolves by API name, e.g. `"alsa_seq"` or `"CoreMIDI"`.
    pub fn resolve_name(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.resolve(Api::from_name(name)?)
    }

    pub fn is_registered(&self, api: Api) -> bool {
        self.factories.contains_key(&api)
    }

    /// Registered APIs in platform priority order, then the rest.
    pub fn available_apis(&self) -> Vec<Api> {
        let mut apis: Vec<Api> = Api::platform_defaults()
            .iter()
            .copied()
            .filter(|api| self.is_registered(*api))
            .collect();
        for api in Api::ALL {
            if self.is_registered(api) && !apis.contains(&api) {
                apis.push(api);
            }
        }
        apis
    }

    /// Highest-priority registered API.
    ///
    /// A UMP-capable platform API wins, then the platform's native MIDI 1.0
    /// API, then the remaining platform order. Falls back to [`Api::Dummy`].
    pub fn default_api(&self) -> Api {
        let platform = Api::platform_defaults();
        platform
            .iter()
            .copied()
            .find(|api| api.is_midi2() && self.is_registered(*api))
            .or_else(|| Api::native_midi1().filter(|api| self.is_registered(*api)))
            .or_else(|| {
                platform
                    .iter()
                    .copied()
                    .find(|api| *api != Api::Dummy && self.is_registered(*api))
            })
            .unwrap_or(Api::Dummy)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();

/// Installs the process-wide registry. Must happen before the first
/// [`global`] call; afterwards the registry is fixed.
pub fn install(registry: BackendRegistry) -> Result<()> {
    GLOBAL
        .set(registry)
        .map_err(|_| Error::InvalidConfig("backend registry already installed".to_string()))
}

/// The process-wide registry, initialised with the built-in backends if
/// nothing was installed.
pub fn global() -> &'static BackendRegistry {
    GLOBAL.get_or_init(BackendRegistry::with_defaults)
}

pub fn resolve(api: Api) -> Result<Arc<dyn Backend>> {
    global().resolve(api)
}

pub fn default_api() -> Api {
    global().default_api()
}

pub fn available_apis() -> Vec<Api> {
    global().available_apis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn minimal() -> BackendRegistry {
        BackendRegistry::builder()
            .register(Api::Dummy, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unregistered_api_fails() {
        let registry = minimal();
        let err = registry.resolve(Api::Jack).err().unwrap();
        assert_eq!(err, Error::UnknownApi("jack".to_string()));
        assert!(registry.resolve_name("no-such-api").is_err());
    }

    #[test]
    fn test_default_resolves_to_dummy_when_alone() {
        let registry = minimal();
        assert_eq!(registry.default_api(), Api::Dummy);
        assert_eq!(registry.resolve(Api::Default).unwrap().api(), Api::Dummy);
    }

    #[test]
    fn test_instances_are_shared() {
        let created = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&created);
        let registry = BackendRegistry::builder()
            .register(Api::Loopback, move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(LoopbackBackend::new()) as Arc<dyn Backend>)
            })
            .build()
            .unwrap();

        let a = registry.resolve(Api::Loopback).unwrap();
        let b = registry.resolve_name("Loopback").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_factory_is_retried_on_next_resolve() {
        let registry = BackendRegistry::builder()
            .register(Api::Jack, || Err(Error::BackendIo("server not running".into())))
            .build()
            .unwrap();
        assert!(matches!(registry.resolve(Api::Jack), Err(Error::BackendIo(_))));
        assert!(matches!(registry.resolve(Api::Jack), Err(Error::BackendIo(_))));
    }

    #[test]
    fn test_default_alias_cannot_be_registered() {
        let result = BackendRegistry::builder()
            .register(Api::Default, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_register_instance_uses_backend_api() {
        let loopback = Arc::new(LoopbackBackend::new());
        loopback.add_port("A");
        let registry = BackendRegistry::builder()
            .register_instance(loopback.clone())
            .build()
            .unwrap();
        let backend = registry.resolve(Api::Loopback).unwrap();
        assert_eq!(
            backend
                .list_ports(unimidi_core::Direction::Output)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_defaults_contain_builtins() {
        let registry = BackendRegistry::with_defaults();
        let apis = registry.available_apis();
        assert!(apis.contains(&Api::Dummy));
        assert!(apis.contains(&Api::Loopback));
        assert!(registry.is_registered(registry.default_api()));
        assert_ne!(registry.default_api(), Api::Loopback);
    }

    #[test]
    fn test_prefers_ump_capable_platform_api() {
        let ump = Api::platform_defaults()
            .iter()
            .copied()
            .find(|api| api.is_midi2());
        let Some(ump) = ump else {
            return;
        };
        let registry = BackendRegistry::builder()
            .register(Api::Dummy, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
            .register(ump, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
            .build()
            .unwrap();
        assert_eq!(registry.default_api(), ump);
    }
}
