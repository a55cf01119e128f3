//! Shared core context
//!
//! One value threaded explicitly through the registry, the job scheduler
//! and the frame scheduler. Holds the configuration, the component type
//! registry and the profiler handle; there are no hidden globals.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
use crate::config::CoreConfig;
use crate::error::Result;
use crate::profiling::ProfilerHandle;
use crate::signature::Signature;

/// Process-level state shared by the core's subsystems
pub struct CoreContext {
    config: CoreConfig,
    components: RwLock<ComponentRegistry>,
    profiler: ProfilerHandle,
}

impl CoreContext {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        let components = ComponentRegistry::new(
            config.max_component_types,
            config.chunk_payload_bytes,
        );
        let profiler = ProfilerHandle::new(config.profiling_enabled);
        Arc::new(Self {
            config,
            components: RwLock::new(components),
            profiler,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn profiler(&self) -> &ProfilerHandle {
        &self.profiler
    }

    /// Register a component type, returning its stable id
    ///
    /// Idempotent per concrete type. Serialized internally; safe to call
    /// from any thread, though bulk registration belongs in startup code.
    pub fn register_component<T: Component>(&self) -> Result<ComponentTypeId> {
        if let Some(id) = self.components.read().lookup::<T>() {
            return Ok(id);
        }
        self.components.write().register::<T>()
    }

    /// Look up a component type id without registering
    pub fn component_id<T: Component>(&self) -> Option<ComponentTypeId> {
        self.components.read().lookup::<T>()
    }

    pub fn component_count(&self) -> usize {
        self.components.read().len()
    }

    /// Run `f` with exclusive access to the component registry
    pub(crate) fn with_components_mut<R>(
        &self,
        f: impl FnOnce(&mut ComponentRegistry) -> R,
    ) -> R {
        f(&mut self.components.write())
    }

    pub(crate) fn component_info(&self, id: ComponentTypeId) -> ComponentInfo {
        *self.components.read().info(id)
    }

    /// Infos for every type in `signature`, in ascending id order
    pub(crate) fn component_infos(
        &self,
        signature: Signature,
    ) -> SmallVec<[ComponentInfo; 8]> {
        let registry = self.components.read();
        signature.ones().map(|id| *registry.info(id)).collect()
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("component_count", &self.component_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_through_context() {
        let ctx = CoreContext::new(CoreConfig::default());
        let a = ctx.register_component::<u32>().unwrap();
        let b = ctx.register_component::<u32>().unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.component_count(), 1);
        assert_eq!(ctx.component_id::<u32>(), Some(a));
        assert_eq!(ctx.component_id::<u64>(), None);
    }

    #[test]
    fn test_concurrent_registration_serializes() {
        let ctx = CoreContext::new(CoreConfig::default());
        std::thread::scope(|s| {
            for _ in 0..4 {
                let ctx = &ctx;
                s.spawn(move || {
                    for _ in 0..100 {
                        ctx.register_component::<u32>().unwrap();
                        ctx.register_component::<u64>().unwrap();
                    }
                });
            }
        });
        assert_eq!(ctx.component_count(), 2);
    }
}
