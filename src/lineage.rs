use std::collections::HashMap;
use std::collections::HashSet;

use crate::core::EntityId;
use crate::storage::LineageRow;

/// Indexed view over the file_lineage table. Resolves any path entity to
/// its chain root (the logical file id all coupling math runs on) and
/// enumerates whole chains for history queries.
///
/// Chains are expected to be acyclic; a cycle means rename detection
/// mis-identified something, so the walk keeps a visited set and stops
/// rather than looping.
#[derive(Debug, Default)]
pub struct LineageMap {
    forward: HashMap<EntityId, Vec<EntityId>>,
    backward: HashMap<EntityId, Vec<EntityId>>,
}

impl LineageMap {
    pub fn new(rows: &[LineageRow]) -> Self {
        let mut forward: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        let mut backward: HashMap<EntityId, Vec<EntityId>> = HashMap::new();

        for row in rows {
            forward.entry(row.old_entity_id).or_default().push(row.new_entity_id);
            backward.entry(row.new_entity_id).or_default().push(row.old_entity_id);
        }

        Self { forward, backward }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// The logical id: the first entity of the chain this entity belongs
    /// to. Entities that were never renamed resolve to themselves.
    pub fn root_of(&self, id: EntityId) -> EntityId {
        let mut visited = HashSet::new();
        let mut current = id;

        while visited.insert(current) {
            // A copy can give a node several predecessors; the oldest id is
            // the original, so follow the smallest.
            match self.backward.get(&current).and_then(|prev| prev.iter().min()) {
                Some(&prev) => current = prev,
                None => return current,
            }
        }

        log::warn!("lineage cycle detected at entity {}", current);
        current
    }

    /// The most recent entity of the chain: the one whose qualified name is
    /// the file's current path (when it still exists at HEAD).
    pub fn tip_of(&self, id: EntityId) -> EntityId {
        let mut visited = HashSet::new();
        let mut current = id;

        while visited.insert(current) {
            match self.forward.get(&current).and_then(|next| next.iter().max()) {
                Some(&next) => current = next,
                None => return current,
            }
        }

        log::warn!("lineage cycle detected at entity {}", current);
        current
    }

    /// Every entity in the chain containing `id`, including `id` itself.
    pub fn chain_of(&self, id: EntityId) -> Vec<EntityId> {
        let mut visited = HashSet::new();
        let mut queue = vec![id];

        while let Some(current) = queue.pop() {
            if !visited.insert(current) {
                continue;
            }

            if let Some(next) = self.forward.get(&current) {
                queue.extend(next.iter().copied());
            }

            if let Some(prev) = self.backward.get(&current) {
                queue.extend(prev.iter().copied());
            }
        }

        let mut chain: Vec<EntityId> = visited.into_iter().collect();
        chain.sort_unstable();
        chain
    }

    /// Precomputed entity → root table for hot loops over change rows.
    pub fn root_table(&self, ids: impl IntoIterator<Item = EntityId>) -> HashMap<EntityId, EntityId> {
        ids.into_iter().map(|id| (id, self.root_of(id))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(old: EntityId, new: EntityId) -> LineageRow {
        LineageRow {
            old_entity_id: old,
            new_entity_id: new,
            commit_oid: format!("{}->{}", old, new),
            similarity: 0.95,
        }
    }

    #[test]
    fn unrenamed_entities_are_their_own_root() {
        let map = LineageMap::new(&[]);
        assert_eq!(map.root_of(42), 42);
        assert_eq!(map.tip_of(42), 42);
        assert_eq!(map.chain_of(42), vec![42]);
    }

    #[test]
    fn chains_resolve_to_first_entity() {
        // a.py (1) -> b.py (2) -> c.py (3)
        let map = LineageMap::new(&[row(1, 2), row(2, 3)]);

        for id in [1, 2, 3] {
            assert_eq!(map.root_of(id), 1);
            assert_eq!(map.tip_of(id), 3);
        }

        assert_eq!(map.chain_of(2), vec![1, 2, 3]);
    }

    #[test]
    fn cycles_terminate_instead_of_looping() {
        let map = LineageMap::new(&[row(1, 2), row(2, 1)]);
        // Any answer is fine as long as the walk returns.
        let _ = map.root_of(1);
        let _ = map.tip_of(2);
        let chain = map.chain_of(1);
        assert_eq!(chain, vec![1, 2]);
    }

    #[test]
    fn copies_fan_out_into_one_chain() {
        // base (1) copied to 2 and 3; 3 later renamed to 4.
        let map = LineageMap::new(&[row(1, 2), row(1, 3), row(3, 4)]);
        assert_eq!(map.root_of(4), 1);
        assert_eq!(map.chain_of(1), vec![1, 2, 3, 4]);
    }
}
