//! Frame plan construction
//!
//! Builds a per-frame execution plan from system access declarations and
//! user ordering constraints. Conflict edges are oriented by the user
//! order where one exists, registration order otherwise; Kahn's algorithm
//! orders the systems and a greedy pass packs them into waves of pairwise
//! conflict-free systems. Construction is deterministic given registration
//! order.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::system::RegisteredSystem;

/// Systems chosen for concurrent execution in one step of the frame
#[derive(Debug, Clone, Default)]
pub struct Wave {
    pub(crate) systems: SmallVec<[usize; 8]>,
}

impl Wave {
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Complete plan for one frame
#[derive(Debug, Clone, Default)]
pub(crate) struct FramePlan {
    pub waves: Vec<Wave>,
}

/// Reachability over the user-constraint edges only, used to orient
/// conflict edges by declared order
fn user_reachability(count: usize, user_edges: &[(usize, usize)]) -> Vec<Vec<bool>> {
    let mut adjacency = vec![Vec::new(); count];
    for &(from, to) in user_edges {
        adjacency[from].push(to);
    }

    let mut reach = vec![vec![false; count]; count];
    for start in 0..count {
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &next in &adjacency[node] {
                if !reach[start][next] {
                    reach[start][next] = true;
                    stack.push(next);
                }
            }
        }
    }
    reach
}

/// Build the frame plan, failing with [`CoreError::ScheduleCycle`] when
/// the combined edges are cyclic
pub(crate) fn build_plan(
    systems: &[RegisteredSystem],
    user_edges: &[(usize, usize)],
) -> Result<FramePlan> {
    let count = systems.len();
    if count == 0 {
        return Ok(FramePlan::default());
    }

    let reach = user_reachability(count, user_edges);

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut in_degree = vec![0usize; count];
    let add_edge = |adjacency: &mut Vec<Vec<usize>>, in_degree: &mut Vec<usize>, from: usize, to: usize| {
        if !adjacency[from].contains(&to) {
            adjacency[from].push(to);
            in_degree[to] += 1;
        }
    };

    for &(from, to) in user_edges {
        add_edge(&mut adjacency, &mut in_degree, from, to);
    }

    // Conflict edge between i < j, oriented by user order when the user
    // declared one, insertion order as tiebreak
    for i in 0..count {
        for j in (i + 1)..count {
            if systems[i].access.conflicts_with(&systems[j].access) {
                if reach[j][i] {
                    add_edge(&mut adjacency, &mut in_degree, j, i);
                } else {
                    add_edge(&mut adjacency, &mut in_degree, i, j);
                }
            }
        }
    }
    for neighbors in &mut adjacency {
        neighbors.sort_unstable();
    }

    // Kahn's algorithm
    let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(count);
    while let Some(node) = queue.pop_front() {
        sorted.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if sorted.len() != count {
        return Err(CoreError::ScheduleCycle);
    }

    // Greedy wave packing: a system joins the current wave iff no member
    // precedes it by an edge and none conflicts with it
    let mut waves: Vec<Wave> = Vec::new();
    let mut current = Wave::default();
    for &system in &sorted {
        let blocked = current.systems.iter().any(|&member| {
            adjacency[member].contains(&system)
                || systems[member]
                    .access
                    .conflicts_with(&systems[system].access)
        });
        if blocked {
            waves.push(std::mem::take(&mut current));
        }
        current.systems.push(system);
    }
    if !current.systems.is_empty() {
        waves.push(current);
    }

    Ok(FramePlan { waves })
}
