//! System access metadata
//!
//! The frame scheduler never inspects system code; it trusts the declared
//! access. Component access is a pair of signatures, resource access a
//! pair of opaque tag sets; the conflict predicate treats both alike.

use rustc_hash::FxHashSet;

use crate::component::Component;
use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::frame::SystemContext;
use crate::registry::Registry;
use crate::signature::Signature;

/// System ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

impl SystemId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Declared data access of one system
#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    /// Component types read
    pub reads: Signature,
    /// Component types written
    pub writes: Signature,
    /// Opaque resource tags read
    pub resource_reads: FxHashSet<String>,
    /// Opaque resource tags written
    pub resource_writes: FxHashSet<String>,
}

impl SystemAccess {
    /// Create empty access
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building an access declaration against a context
    pub fn builder(ctx: &CoreContext) -> AccessBuilder<'_> {
        AccessBuilder {
            ctx,
            access: SystemAccess::empty(),
            error: None,
        }
    }

    /// Check if two systems may not run concurrently
    ///
    /// Conflict iff one's writes intersect the other's reads or writes,
    /// for components or resource tags.
    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        if self.writes.intersects(other.reads.union(other.writes))
            || other.writes.intersects(self.reads.union(self.writes))
        {
            return true;
        }

        let touches = |writes: &FxHashSet<String>, other: &SystemAccess| {
            writes
                .iter()
                .any(|tag| other.resource_reads.contains(tag) || other.resource_writes.contains(tag))
        };
        touches(&self.resource_writes, other) || touches(&other.resource_writes, self)
    }
}

/// Builder resolving component types to ids while declaring access
pub struct AccessBuilder<'c> {
    ctx: &'c CoreContext,
    access: SystemAccess,
    error: Option<CoreError>,
}

impl AccessBuilder<'_> {
    /// Declare a read of component `T`, registering the type if needed
    pub fn reads<T: Component>(mut self) -> Self {
        match self.ctx.register_component::<T>() {
            Ok(id) => self.access.reads = self.access.reads.with(id),
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Declare a write of component `T`, registering the type if needed
    pub fn writes<T: Component>(mut self) -> Self {
        match self.ctx.register_component::<T>() {
            Ok(id) => self.access.writes = self.access.writes.with(id),
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Declare a read of an opaque resource tag
    pub fn reads_resource(mut self, tag: &str) -> Self {
        self.access.resource_reads.insert(tag.to_string());
        self
    }

    /// Declare a write of an opaque resource tag
    pub fn writes_resource(mut self, tag: &str) -> Self {
        self.access.resource_writes.insert(tag.to_string());
        self
    }

    pub fn build(self) -> Result<SystemAccess> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.access),
        }
    }
}

/// Boxed system run function
pub type SystemFn = Box<dyn Fn(&Registry, &SystemContext<'_>) -> Result<()> + Send + Sync>;

/// A registered system: name, trusted access declaration, run function
pub(crate) struct RegisteredSystem {
    pub name: String,
    pub access: SystemAccess,
    pub run: SystemFn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;

    struct A;
    struct B;

    fn access(ctx: &CoreContext) -> (SystemAccess, SystemAccess) {
        let writes_a = SystemAccess::builder(ctx).writes::<A>().build().unwrap();
        let reads_a = SystemAccess::builder(ctx).reads::<A>().build().unwrap();
        (writes_a, reads_a)
    }

    #[test]
    fn test_write_read_conflicts() {
        let ctx = CoreContext::new(CoreConfig::default());
        let (writes_a, reads_a) = access(&ctx);
        assert!(writes_a.conflicts_with(&reads_a));
        assert!(reads_a.conflicts_with(&writes_a));
        assert!(writes_a.conflicts_with(&writes_a));
    }

    #[test]
    fn test_read_read_no_conflict() {
        let ctx = CoreContext::new(CoreConfig::default());
        let (_, reads_a) = access(&ctx);
        assert!(!reads_a.conflicts_with(&reads_a));
    }

    #[test]
    fn test_disjoint_writes_no_conflict() {
        let ctx = CoreContext::new(CoreConfig::default());
        let writes_a = SystemAccess::builder(&ctx).writes::<A>().build().unwrap();
        let writes_b = SystemAccess::builder(&ctx).writes::<B>().build().unwrap();
        assert!(!writes_a.conflicts_with(&writes_b));
    }

    #[test]
    fn test_resource_tags_conflict_like_components() {
        let ctx = CoreContext::new(CoreConfig::default());
        let writer = SystemAccess::builder(&ctx)
            .writes_resource("render_list")
            .build()
            .unwrap();
        let reader = SystemAccess::builder(&ctx)
            .reads_resource("render_list")
            .build()
            .unwrap();
        let other = SystemAccess::builder(&ctx)
            .reads_resource("audio")
            .build()
            .unwrap();

        assert!(writer.conflicts_with(&reader));
        assert!(!writer.conflicts_with(&other));
        assert!(!reader.conflicts_with(&reader));
    }
}
