// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunk ECS - archetype ECS core with a work-stealing parallel scheduler
//!
//! Three subsystems form the core:
//!
//! - an archetype [`Registry`] storing components in column-oriented
//!   16 KiB chunks keyed by [`Signature`],
//! - a [`JobScheduler`] running jobs over bounded work-stealing deques
//!   with priorities, dependencies and cooperative cancellation,
//! - a [`FrameScheduler`] that derives conflict-free waves from per-system
//!   access declarations and dispatches them as jobs.
//!
//! ```
//! use chunk_ecs::{CoreConfig, Registry};
//!
//! let mut registry = Registry::new(CoreConfig::default());
//! let entity = registry.create_entity((1u32, 2.0f32)).unwrap();
//! assert_eq!(*registry.get::<u32>(entity).unwrap(), 1);
//! ```

pub mod chunk;
pub mod command;
pub mod component;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod frame;
pub mod job;
pub mod profiling;
pub mod query;
pub mod registry;
pub mod schedule;
pub mod signature;
pub mod system;

mod deque;
mod worker;


// Re-exports for convenience
pub use chunk::{Archetype, ArchetypeId};
pub use command::{Command, CommandBuffer};
pub use component::{
    Component, ComponentInfo, ComponentPack, ComponentRegistry, ComponentTypeId,
    EntityBuilder, MAX_COMPONENT_TYPES, MAX_PACK_COMPONENTS,
};
pub use config::CoreConfig;
pub use context::CoreContext;
pub use entity::Entity;
pub use error::{CoreError, Result};
pub use frame::{FrameOutcome, FrameScheduler, SystemContext};
pub use job::{Job, JobContext, JobHandle, JobPriority, JobScheduler, JobState};
pub use profiling::{ProfilerHandle, SystemSpan, SystemStats};
pub use query::{ChunkView, ChunkViewMut, Query, QueryBuilder, RowView};
pub use registry::Registry;
pub use schedule::Wave;
pub use signature::Signature;
pub use system::{AccessBuilder, SystemAccess, SystemFn, SystemId};
