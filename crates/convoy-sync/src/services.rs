//! Lazy, single-flight service initialization with declared dependencies.
//!
//! Services are registered up front with a name, an ordered dependency list
//! and an async init function; `build()` validates the graph (every
//! dependency exists, no cycles) and fails fast. `get()` initializes a
//! service at most once per process: concurrent requesters share the one
//! in-flight init future, and a failed init is terminal — every current and
//! future caller receives the same error, with no automatic retry at this
//! layer. Startup initializes nothing expensive; real work happens on the
//! first real `get`.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use convoy_core::{ConvoyError, ConvoyResult};

/// An initialized service instance, downcast by the caller.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type InitFn =
    Box<dyn Fn(ServiceRegistry) -> BoxFuture<'static, ConvoyResult<ServiceInstance>> + Send + Sync>;

type InitFuture = Shared<BoxFuture<'static, Result<ServiceInstance, Arc<ConvoyError>>>>;

struct ServiceDef {
    name: String,
    dependencies: Vec<String>,
    init: InitFn,
}

enum HandleState {
    Uninitialized,
    Initializing(InitFuture),
    Ready(ServiceInstance),
    Failed(Arc<ConvoyError>),
}

struct RegistryInner {
    defs: HashMap<String, Arc<ServiceDef>>,
    states: TokioMutex<HashMap<String, HandleState>>,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish_non_exhaustive()
    }
}

pub struct ServiceRegistryBuilder {
    defs: Vec<ServiceDef>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder { defs: Vec::new() }
    }

    /// Deliberately initializes nothing expensive: the graph was validated
    /// at build time and every service waits for its first real `get`.
    pub fn init_critical(&self) {
        info!(
            services = self.inner.defs.len(),
            "service registry armed (lazy init)"
        );
    }

    /// Get (initializing if needed) the service and downcast it.
    pub async fn get_as<T: Any + Send + Sync>(&self, name: &str) -> ConvoyResult<Arc<T>> {
        let instance = self.get(name).await?;
        instance
            .downcast::<T>()
            .map_err(|_| ConvoyError::ServiceInit {
                name: name.to_string(),
                message: "instance has a different type than requested".to_string(),
            })
    }

    /// Get (initializing if needed) the raw service instance.
    ///
    /// Boxed for recursion: dependencies resolve through the same path.
    pub fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ConvoyResult<ServiceInstance>> {
        async move {
            enum Step {
                Unknown,
                Ready(ServiceInstance),
                Failed(Arc<ConvoyError>),
                Join(InitFuture),
                Start,
            }

            let fut = {
                let mut states = self.inner.states.lock().await;
                let step = match states.get(name) {
                    None => Step::Unknown,
                    Some(HandleState::Ready(instance)) => Step::Ready(instance.clone()),
                    Some(HandleState::Failed(err)) => Step::Failed(err.clone()),
                    Some(HandleState::Initializing(fut)) => Step::Join(fut.clone()),
                    Some(HandleState::Uninitialized) => Step::Start,
                };

                match step {
                    Step::Unknown => return Err(ConvoyError::UnknownService(name.to_string())),
                    Step::Ready(instance) => return Ok(instance),
                    Step::Failed(err) => {
                        return Err(ConvoyError::ServiceInit {
                            name: name.to_string(),
                            message: err.to_string(),
                        })
                    }
                    Step::Join(fut) => {
                        debug!(service = name, "awaiting in-flight init");
                        fut
                    }
                    Step::Start => {
                        let def = match self.inner.defs.get(name) {
                            Some(def) => def.clone(),
                            None => return Err(ConvoyError::UnknownService(name.to_string())),
                        };
                        let registry = self.clone();
                        let fut: InitFuture = async move {
                            // Dependencies first, in declared order.
                            for dep in &def.dependencies {
                                registry.get(dep).await.map_err(Arc::new)?;
                            }
                            debug!(service = %def.name, "initializing");
                            (def.init)(registry.clone()).await.map_err(Arc::new)
                        }
                        .boxed()
                        .shared();
                        states.insert(name.to_string(), HandleState::Initializing(fut.clone()));
                        fut
                    }
                }
            };

            let result = fut.await;

            // First resolver records the terminal state; later awaiters
            // re-record the same value, which is harmless.
            let mut states = self.inner.states.lock().await;
            match &result {
                Ok(instance) => {
                    states.insert(name.to_string(), HandleState::Ready(instance.clone()));
                }
                Err(err) => {
                    warn!(service = name, "init failed permanently: {err}");
                    states.insert(name.to_string(), HandleState::Failed(err.clone()));
                }
            }

            result.map_err(|err| ConvoyError::ServiceInit {
                name: name.to_string(),
                message: err.to_string(),
            })
        }
        .boxed()
    }

    /// Snapshot of handle states (diagnostics).
    pub async fn states(&self) -> HashMap<String, &'static str> {
        let states = self.inner.states.lock().await;
        states
            .iter()
            .map(|(name, state)| {
                let label = match state {
                    HandleState::Uninitialized => "uninitialized",
                    HandleState::Initializing(_) => "initializing",
                    HandleState::Ready(_) => "ready",
                    HandleState::Failed(_) => "failed",
                };
                (name.clone(), label)
            })
            .collect()
    }
}

impl ServiceRegistryBuilder {
    /// Register a service. Dependencies are initialized, in order, before
    /// the service's own init function runs.
    pub fn service<F, Fut, T>(mut self, name: &str, dependencies: &[&str], init: F) -> Self
    where
        F: Fn(ServiceRegistry) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ConvoyResult<Arc<T>>> + Send + 'static,
        T: Any + Send + Sync,
    {
        self.defs.push(ServiceDef {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            init: Box::new(move |registry| {
                let fut = init(registry);
                async move {
                    let instance: ServiceInstance = fut.await?;
                    Ok(instance)
                }
                .boxed()
            }),
        });
        self
    }

    /// Validate the graph and produce the registry. Duplicate names, unknown
    /// dependencies and cycles all fail fast here.
    pub fn build(self) -> ConvoyResult<ServiceRegistry> {
        let mut defs: HashMap<String, Arc<ServiceDef>> = HashMap::new();
        for def in self.defs {
            if defs.contains_key(&def.name) {
                return Err(ConvoyError::Config(format!(
                    "duplicate service definition: {}",
                    def.name
                )));
            }
            defs.insert(def.name.clone(), Arc::new(def));
        }

        for def in defs.values() {
            for dep in &def.dependencies {
                if !defs.contains_key(dep) {
                    return Err(ConvoyError::Config(format!(
                        "service '{}' depends on unknown service '{dep}'",
                        def.name
                    )));
                }
            }
        }

        check_acyclic(&defs)?;

        let states = defs
            .keys()
            .map(|name| (name.clone(), HandleState::Uninitialized))
            .collect();

        Ok(ServiceRegistry {
            inner: Arc::new(RegistryInner {
                defs,
                states: TokioMutex::new(states),
            }),
        })
    }
}

fn check_acyclic(defs: &HashMap<String, Arc<ServiceDef>>) -> ConvoyResult<()> {
    fn visit(
        name: &str,
        defs: &HashMap<String, Arc<ServiceDef>>,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> ConvoyResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if visiting.iter().any(|n| n == name) {
            return Err(ConvoyError::Config(format!(
                "service dependency cycle: {} -> {name}",
                visiting.join(" -> ")
            )));
        }
        visiting.push(name.to_string());
        if let Some(def) = defs.get(name) {
            for dep in &def.dependencies {
                visit(dep, defs, visiting, done)?;
            }
        }
        visiting.pop();
        done.insert(name.to_string());
        Ok(())
    }

    let mut done = HashSet::new();
    for name in defs.keys() {
        visit(name, defs, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}
