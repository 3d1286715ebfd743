//! Generation Order
//!
//! Decides which of a batch of recompute requests may run now and which
//! must wait for a prerequisite in the same batch.
//!
//! # Algorithm
//!
//! An id `x` has a prerequisite `r` when `r` is another requested id and
//! `x` lies in `r`'s Descent subtree. We layer the requests with Kahn's
//! algorithm over that relation:
//!
//! 1. Count, for every requested id, how many other requested ids have it
//!    in their subtree.
//! 2. Ids with a count of zero form the first generation.
//! 3. Removing a generation decrements the counts of everything in its
//!    members' subtrees; ids that reach zero form the next generation.
//!
//! Only the first generation runs in a given wave; the rest are re-enqueued.
//! Ids caught in a cycle never reach zero. They are appended as one final
//! generation, and if nothing else is runnable they are run together so a
//! cycle cannot stall the bus.

use std::collections::{HashMap, HashSet};

use crate::ids::EntityId;

/// Requested ids layered into generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationPlan {
    generations: Vec<Vec<EntityId>>,
    cyclic: bool,
}

impl GenerationPlan {
    /// Layer `requested` using each id's Descent subtree.
    ///
    /// `subtrees` maps a requested id to every id below it; ids missing
    /// from the map are treated as leaves. Duplicate requests collapse.
    pub fn build(requested: &[EntityId], subtrees: &HashMap<EntityId, Vec<EntityId>>) -> Self {
        let mut ids: Vec<EntityId> = Vec::with_capacity(requested.len());
        let mut seen = HashSet::new();
        for id in requested {
            if seen.insert(id) {
                ids.push(id.clone());
            }
        }
        let members: HashSet<&EntityId> = ids.iter().collect();

        // Edges of the prerequisite relation restricted to the request set.
        let mut dependents: HashMap<&EntityId, Vec<&EntityId>> = HashMap::new();
        let mut in_degree: HashMap<&EntityId, usize> = ids.iter().map(|id| (id, 0)).collect();
        for id in &ids {
            let below = subtrees.get(id).map(Vec::as_slice).unwrap_or_default();
            let mut unique = HashSet::new();
            for other in below {
                if other != id && unique.insert(other) {
                    if let Some(member) = members.get(other) {
                        dependents.entry(id).or_default().push(*member);
                        if let Some(degree) = in_degree.get_mut(other) {
                            *degree += 1;
                        }
                    }
                }
            }
        }

        let mut generations = Vec::new();
        let mut current: Vec<&EntityId> = ids.iter().filter(|id| in_degree[id] == 0).collect();
        let mut placed = 0usize;
        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for id in &current {
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            generations.push(current.into_iter().cloned().collect::<Vec<_>>());
            current = next;
        }

        let cyclic = placed < ids.len();
        if cyclic {
            let placed_ids: HashSet<&EntityId> = generations.iter().flatten().collect();
            let leftover: Vec<EntityId> = ids
                .iter()
                .filter(|id| !placed_ids.contains(id))
                .cloned()
                .collect();
            generations.push(leftover);
        }

        Self { generations, cyclic }
    }

    /// Ids that may run in this wave.
    pub fn first(&self) -> &[EntityId] {
        self.generations.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// Ids to re-enqueue for a later wave.
    pub fn deferred(&self) -> Vec<EntityId> {
        self.generations.iter().skip(1).flatten().cloned().collect()
    }

    /// All generations in order.
    pub fn generations(&self) -> &[Vec<EntityId>] {
        &self.generations
    }

    /// Whether some requests could only be placed by breaking a cycle.
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }
}
