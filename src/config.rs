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

//! Core configuration

use std::time::Duration;

use crate::component::MAX_COMPONENT_TYPES;

/// Default per-worker deque slot count
pub const DEFAULT_DEQUE_CAPACITY: usize = 4096;

/// Default chunk payload size in bytes
pub const DEFAULT_CHUNK_PAYLOAD: usize = 16 * 1024;

/// Default capacity of each global spill ring
pub const DEFAULT_SPILL_CAPACITY: usize = 65_536;

/// Configuration for the core
///
/// Construct with [`CoreConfig::default`] and override with the `with_*`
/// methods. The same value configures the registry, the job scheduler and
/// the frame scheduler when they share a [`CoreContext`](crate::CoreContext).
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Number of worker threads. Default: logical cores − 1, minimum 1.
    pub worker_count: usize,

    /// Per-worker deque slot count. Rounded up to a power of two.
    pub deque_capacity: usize,

    /// Archetype chunk payload size in bytes.
    pub chunk_payload_bytes: usize,

    /// Ceiling on distinct component types. Clamped to 64.
    pub max_component_types: usize,

    /// Enable instrumentation counters.
    pub profiling_enabled: bool,

    /// Max wall time for a `run_frame` call. `None` = unbounded.
    pub frame_deadline: Option<Duration>,

    /// Capacity of each global spill ring used when worker deques overflow.
    pub global_spill_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_count: cores.saturating_sub(1).max(1),
            deque_capacity: DEFAULT_DEQUE_CAPACITY,
            chunk_payload_bytes: DEFAULT_CHUNK_PAYLOAD,
            max_component_types: MAX_COMPONENT_TYPES,
            profiling_enabled: false,
            frame_deadline: None,
            global_spill_capacity: DEFAULT_SPILL_CAPACITY,
        }
    }
}

impl CoreConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_deque_capacity(mut self, capacity: usize) -> Self {
        self.deque_capacity = capacity.max(2);
        self
    }

    /// Clamped below at 64 bytes so even the empty archetype fits a row.
    pub fn with_chunk_payload_bytes(mut self, bytes: usize) -> Self {
        self.chunk_payload_bytes = bytes.max(64);
        self
    }

    /// Values above 64 are clamped; the signature word has 64 bits.
    pub fn with_max_component_types(mut self, count: usize) -> Self {
        self.max_component_types = count.min(MAX_COMPONENT_TYPES);
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling_enabled = enabled;
        self
    }

    pub fn with_frame_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.frame_deadline = deadline;
        self
    }

    pub fn with_global_spill_capacity(mut self, capacity: usize) -> Self {
        self.global_spill_capacity = capacity.max(1);
        self
    }
}
