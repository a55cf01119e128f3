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

//! Error types

use std::fmt;

/// Core error type
///
/// Every fallible operation in the crate returns one of these; there is no
/// panicking control flow across the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Entity index was never allocated or is currently free
    UnknownEntity,

    /// Entity index is live but the handle's generation is stale
    StaleEntity,

    /// Component not present on the entity
    MissingComponent,

    /// Component already present on the entity
    DuplicateComponent,

    /// Component instance does not fit in a chunk payload
    ComponentTooLarge(&'static str),

    /// Component type ceiling (64) exceeded
    TooManyComponentTypes,

    /// Signature's combined row does not fit in a chunk payload
    ArchetypeTooWide,

    /// Backing allocator refused a chunk slab
    ChunkAllocationFailed,

    /// Ordering constraints and data conflicts form a cycle
    ScheduleCycle,

    /// A job panicked; message captured from the unwind payload
    JobFailed(String),

    /// Job or system was cancelled before completion
    Cancelled,

    /// Frame deadline expired before all waves ran
    Deadline,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::UnknownEntity => write!(f, "Unknown entity"),
            CoreError::StaleEntity => write!(f, "Stale entity handle"),
            CoreError::MissingComponent => write!(f, "Component not present on entity"),
            CoreError::DuplicateComponent => write!(f, "Component already present on entity"),
            CoreError::ComponentTooLarge(name) => {
                write!(f, "Component {name} exceeds the chunk payload budget")
            }
            CoreError::TooManyComponentTypes => {
                write!(f, "Component type ceiling (64) exceeded")
            }
            CoreError::ArchetypeTooWide => {
                write!(f, "Archetype row does not fit in a chunk payload")
            }
            CoreError::ChunkAllocationFailed => write!(f, "Chunk allocation failed"),
            CoreError::ScheduleCycle => write!(f, "System ordering cycle detected"),
            CoreError::JobFailed(msg) => write!(f, "Job failed: {msg}"),
            CoreError::Cancelled => write!(f, "Cancelled"),
            CoreError::Deadline => write!(f, "Frame deadline exceeded"),
        }
    }
}

impl std::error::Error for CoreError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;
