//! Engine registry with lazy, reference-counted initialization.
//!
//! Engines are registered as factories under a string tag. The first
//! [`NodeExecutorRegistry::acquire`] of a tag constructs and initializes the
//! engine; the matching last [`NodeExecutorRegistry::release`] finalizes it.
//! The registry is an ordinary value owned by whoever loads models, not a
//! process global.

use hyflow_core::error::{HyflowError, Result};
use hyflow_core::traits::{NodeExecutor, NodeExecutorFactory};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct EngineEntry {
    factory: NodeExecutorFactory,
    live: Option<Arc<dyn NodeExecutor>>,
    refs: usize,
}

/// String-keyed registry of node executors.
#[derive(Default)]
pub struct NodeExecutorRegistry {
    engines: Mutex<HashMap<String, EngineEntry>>,
}

impl NodeExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `engine`, replacing any previous factory.
    /// A live instance of the old factory stays in use until released.
    pub fn register(&self, engine: impl Into<String>, factory: NodeExecutorFactory) {
        let engine = engine.into();
        let mut engines = self.engines.lock();
        match engines.get_mut(&engine) {
            Some(entry) => entry.factory = factory,
            None => {
                engines.insert(
                    engine.clone(),
                    EngineEntry {
                        factory,
                        live: None,
                        refs: 0,
                    },
                );
            }
        }
        tracing::debug!(engine = %engine, "Node executor registered");
    }

    /// Register a closure as the factory for `engine`.
    pub fn register_fn<F>(&self, engine: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn NodeExecutor>> + Send + Sync + 'static,
    {
        self.register(engine, Arc::new(factory));
    }

    /// Get the engine, constructing and initializing it on first use.
    pub fn acquire(&self, engine: &str) -> Result<Arc<dyn NodeExecutor>> {
        let mut engines = self.engines.lock();
        let entry = engines
            .get_mut(engine)
            .ok_or_else(|| HyflowError::EngineNotFound {
                engine: engine.to_string(),
            })?;

        let executor = match &entry.live {
            Some(executor) => Arc::clone(executor),
            None => {
                let executor = (entry.factory)()?;
                executor.initialize()?;
                tracing::info!(engine = %engine, "Node executor initialized");
                entry.live = Some(Arc::clone(&executor));
                executor
            }
        };
        entry.refs += 1;
        Ok(executor)
    }

    /// Drop one reference. The engine is finalized when none remain.
    pub fn release(&self, engine: &str) -> Result<()> {
        let finalize = {
            let mut engines = self.engines.lock();
            let entry = engines
                .get_mut(engine)
                .ok_or_else(|| HyflowError::EngineNotFound {
                    engine: engine.to_string(),
                })?;
            if entry.refs == 0 {
                return Err(HyflowError::InvalidState {
                    component: format!("engine {engine}"),
                    cause: "released more often than acquired".to_string(),
                });
            }
            entry.refs -= 1;
            if entry.refs == 0 {
                entry.live.take()
            } else {
                None
            }
        };

        if let Some(executor) = finalize {
            executor.finalize()?;
            tracing::info!(engine = %engine, "Node executor finalized");
        }
        Ok(())
    }

    /// Outstanding references to `engine`.
    pub fn ref_count(&self, engine: &str) -> usize {
        self.engines.lock().get(engine).map_or(0, |e| e.refs)
    }

    /// Whether `engine` is currently constructed.
    pub fn is_live(&self, engine: &str) -> bool {
        self.engines
            .lock()
            .get(engine)
            .is_some_and(|e| e.live.is_some())
    }

    /// Registered engine tags, sorted.
    pub fn engines(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.engines.lock().keys().cloned().collect();
        tags.sort();
        tags
    }
}

impl fmt::Debug for NodeExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeExecutorRegistry")
            .field("engines", &self.engines())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_core::graph::NodeDescriptor;
    use hyflow_core::traits::NodeTask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        initialized: AtomicUsize,
        finalized: Arc<AtomicUsize>,
    }

    impl NodeExecutor for CountingEngine {
        fn engine(&self) -> &str {
            "counting"
        }

        fn initialize(&self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finalize(&self) -> Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load_task(&self, node: &NodeDescriptor) -> Result<Arc<dyn NodeTask>> {
            Err(HyflowError::KernelLoad {
                node: node.id,
                op_type: node.op_type.clone(),
                cause: "no kernels".to_string(),
            })
        }
    }

    fn registry_with_counter() -> (NodeExecutorRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let registry = NodeExecutorRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let (b, f) = (Arc::clone(&built), Arc::clone(&finalized));
        registry.register_fn("counting", move || {
            b.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingEngine {
                initialized: AtomicUsize::new(0),
                finalized: Arc::clone(&f),
            }) as Arc<dyn NodeExecutor>)
        });
        (registry, built, finalized)
    }

    #[test]
    fn lazily_constructed_once() {
        let (registry, built, _) = registry_with_counter();
        assert!(!registry.is_live("counting"));
        let a = registry.acquire("counting").unwrap();
        let b = registry.acquire("counting").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count("counting"), 2);
    }

    #[test]
    fn finalized_on_last_release() {
        let (registry, built, finalized) = registry_with_counter();
        registry.acquire("counting").unwrap();
        registry.acquire("counting").unwrap();
        registry.release("counting").unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        registry.release("counting").unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(!registry.is_live("counting"));

        registry.acquire("counting").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_engine_and_over_release() {
        let (registry, _, _) = registry_with_counter();
        let err = registry.acquire("cuda").err().unwrap();
        assert_eq!(err.code(), "E101");
        assert!(registry.release("counting").is_err());
        assert_eq!(registry.engines(), vec!["counting".to_string()]);
    }
}
