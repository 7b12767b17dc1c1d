//! Named driver constructors.
//!
//! A [`DriverRegistry`] is filled once at startup, then shared read-only by
//! everything that instantiates providers. Each registered driver offers one
//! capability, decided by its [`Constructor`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use crate::provider::{MvtTiler, ProviderKind, ProviderUnion, Tiler};
use crate::{Error, Result};

type InitFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type StandardInit = Box<dyn Fn(serde_yaml::Value) -> InitFuture<Box<dyn Tiler>> + Send + Sync>;
type NativeTileInit = Box<dyn Fn(serde_yaml::Value) -> InitFuture<Box<dyn MvtTiler>> + Send + Sync>;

/// Releases whatever a driver's providers hold, at shutdown.
pub type Cleanup = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Builds a provider from its configuration.
pub enum Constructor {
    Standard(StandardInit),
    NativeTile(NativeTileInit),
}

impl Constructor {
    pub fn standard<F, Fut>(init: F) -> Self
    where
        F: Fn(serde_yaml::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Tiler>>> + Send + 'static,
    {
        Constructor::Standard(Box::new(move |config| Box::pin(init(config))))
    }

    pub fn native_tile<F, Fut>(init: F) -> Self
    where
        F: Fn(serde_yaml::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn MvtTiler>>> + Send + 'static,
    {
        Constructor::NativeTile(Box::new(move |config| Box::pin(init(config))))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Constructor::Standard(_) => ProviderKind::Standard,
            Constructor::NativeTile(_) => ProviderKind::NativeTile,
        }
    }
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constructor({})", self.kind())
    }
}

pub fn cleanup<F, Fut>(cleanup: F) -> Cleanup
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(cleanup()))
}

struct Driver {
    constructor: Constructor,
    cleanup: Option<Cleanup>,
    instances: AtomicUsize,
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `postgis`, `mvt_postgis` and `debug` drivers.
    pub fn with_default_drivers() -> Result<Self> {
        let mut registry = Self::new();
        crate::postgis::register(&mut registry)?;
        crate::gpkg::register(&mut registry)?;
        crate::debug::register(&mut registry)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        constructor: Option<Constructor>,
        cleanup: Option<Cleanup>,
    ) -> Result<()> {
        let constructor =
            constructor.ok_or_else(|| Error::InvalidConstructor(name.to_string()))?;
        if self.drivers.contains_key(name) {
            return Err(Error::DuplicateDriver(name.to_string()));
        }

        debug!(driver = name, kind = %constructor.kind(), "registered driver");
        self.drivers.insert(
            name.to_string(),
            Driver {
                constructor,
                cleanup,
                instances: AtomicUsize::new(0),
            },
        );
        Ok(())
    }

    /// Names of the drivers offering any of `kinds`, sorted. All drivers when
    /// `kinds` is empty.
    pub fn drivers(&self, kinds: &[ProviderKind]) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .iter()
            .filter(|(_, driver)| kinds.is_empty() || kinds.contains(&driver.constructor.kind()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    pub async fn instantiate(&self, name: &str, config: serde_yaml::Value) -> Result<ProviderUnion> {
        let driver = self.drivers.get(name).ok_or_else(|| Error::UnknownDriver {
            name: name.to_string(),
            known: self.drivers(&[]),
        })?;

        let provider = match &driver.constructor {
            Constructor::Standard(init) => ProviderUnion::Standard(init(config).await?),
            Constructor::NativeTile(init) => ProviderUnion::NativeTile(init(config).await?),
        };
        driver.instances.fetch_add(1, Ordering::SeqCst);

        info!(driver = name, kind = %driver.constructor.kind(), "created provider");
        Ok(provider)
    }

    /// Runs the cleanup of every driver that created at least one provider.
    pub async fn shutdown(&self) {
        for (name, driver) in &self.drivers {
            if driver.instances.swap(0, Ordering::SeqCst) == 0 {
                continue;
            }
            if let Some(cleanup) = &driver.cleanup {
                info!(driver = %name, "cleaning up providers");
                cleanup().await;
            }
        }
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers(&[]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::debug::DebugProvider;

    fn debug_constructor() -> Constructor {
        Constructor::standard(|_| async { Ok(Box::new(DebugProvider::new()?) as Box<dyn Tiler>) })
    }

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> Cleanup {
        let counter = counter.clone();
        cleanup(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn test_register_rejects_duplicates_and_missing_constructors() {
        let mut registry = DriverRegistry::new();
        registry.register("debug", Some(debug_constructor()), None).unwrap();

        assert!(matches!(
            registry.register("debug", Some(debug_constructor()), None),
            Err(Error::DuplicateDriver(name)) if name == "debug"
        ));
        assert!(matches!(
            registry.register("other", None, None),
            Err(Error::InvalidConstructor(name)) if name == "other"
        ));
        assert_eq!(vec!["debug".to_string()], registry.drivers(&[]));
    }

    #[tokio::test]
    async fn test_unknown_driver_lists_known_names() {
        let mut registry = DriverRegistry::new();
        registry.register("b", Some(debug_constructor()), None).unwrap();
        registry.register("a", Some(debug_constructor()), None).unwrap();

        match registry.instantiate("c", serde_yaml::Value::Null).await {
            Err(Error::UnknownDriver { name, known }) => {
                assert_eq!("c", name);
                assert_eq!(vec!["a", "b"], known);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_instantiate_surfaces_constructor_errors() {
        let mut registry = DriverRegistry::new();
        registry
            .register(
                "broken",
                Some(Constructor::standard(|_| async {
                    Err(Error::Config("missing host".to_string()))
                })),
                None,
            )
            .unwrap();

        let result = registry.instantiate("broken", serde_yaml::Value::Null).await;
        assert!(matches!(result, Err(Error::Config(msg)) if msg == "missing host"));
    }

    #[test]
    fn test_drivers_filter_by_kind() {
        let registry = DriverRegistry::with_default_drivers().unwrap();

        assert_eq!(vec!["debug", "gpkg", "mvt_postgis", "postgis"], registry.drivers(&[]));
        assert_eq!(
            vec!["debug", "gpkg", "postgis"],
            registry.drivers(&[ProviderKind::Standard])
        );
        assert_eq!(
            vec!["mvt_postgis"],
            registry.drivers(&[ProviderKind::NativeTile])
        );
        assert_eq!(
            registry.drivers(&[]),
            registry.drivers(&[ProviderKind::Standard, ProviderKind::NativeTile])
        );
    }

    #[tokio::test]
    async fn test_shutdown_cleans_up_instantiated_drivers() {
        let used = Arc::new(AtomicUsize::new(0));
        let unused = Arc::new(AtomicUsize::new(0));

        let mut registry = DriverRegistry::new();
        registry
            .register("used", Some(debug_constructor()), Some(counting_cleanup(&used)))
            .unwrap();
        registry
            .register("unused", Some(debug_constructor()), Some(counting_cleanup(&unused)))
            .unwrap();

        let provider = registry.instantiate("used", serde_yaml::Value::Null).await.unwrap();
        assert_eq!(Some(ProviderKind::Standard), provider.kind());
        registry.instantiate("used", serde_yaml::Value::Null).await.unwrap();

        registry.shutdown().await;
        assert_eq!(1, used.load(Ordering::SeqCst));
        assert_eq!(0, unused.load(Ordering::SeqCst));
    }
}
