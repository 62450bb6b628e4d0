//! Shard assignment calculation
//!
//! Pure functions: the cluster link feeds them the live agents it read during a
//! pulse and records the result.

use crate::config::{Sharding, ValidatedSettings};
use shardline_metadata::ShardAssignment;

/// One entry per local agent to start.
///
/// Static sharding yields one `Some` per configured index (already deduplicated
/// and sorted by validation). Dynamic sharding yields a single `None`: one agent
/// whose assignment is decided at runtime from the live cluster.
pub fn compute_assignments(settings: &ValidatedSettings) -> Vec<Option<ShardAssignment>> {
    match &settings.sharding {
        Sharding::Dynamic => vec![None],
        Sharding::Static {
            total_count,
            assigned,
        } => assigned
            .iter()
            .filter_map(|&index| ShardAssignment::new(*total_count, index))
            .map(Some)
            .collect(),
    }
}

/// Assignment of `self_id` among the live agents, sorted by id.
///
/// The total is the live count and the index is the agent's position, so every
/// agent reading the same live set derives a distinct index. Returns `None`
/// when `self_id` is not in the set.
pub fn dynamic_assignment(sorted_live_ids: &[i64], self_id: i64) -> Option<ShardAssignment> {
    let position = sorted_live_ids.binary_search(&self_id).ok()?;
    ShardAssignment::new(
        u32::try_from(sorted_live_ids.len()).ok()?,
        u32::try_from(position).ok()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationSettings, ShardSettings};

    fn validated(shards: ShardSettings) -> ValidatedSettings {
        CoordinationSettings {
            shards,
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn test_dynamic_yields_single_unassigned_entry() {
        let settings = validated(ShardSettings::default());
        assert_eq!(compute_assignments(&settings), vec![None]);
    }

    #[test]
    fn test_static_yields_one_entry_per_distinct_index() {
        let settings = validated(ShardSettings {
            is_static: true,
            total_count: Some(5),
            assigned: Some(vec![4, 1, 4, 1, 1]),
        });

        assert_eq!(
            compute_assignments(&settings),
            vec![ShardAssignment::new(5, 1), ShardAssignment::new(5, 4)]
        );
    }

    #[test]
    fn test_dynamic_assignment_is_position_in_live_set() {
        let live = [3, 8, 21];
        assert_eq!(dynamic_assignment(&live, 3), ShardAssignment::new(3, 0));
        assert_eq!(dynamic_assignment(&live, 8), ShardAssignment::new(3, 1));
        assert_eq!(dynamic_assignment(&live, 21), ShardAssignment::new(3, 2));
        assert_eq!(dynamic_assignment(&live, 5), None);
    }

    #[test]
    fn test_dynamic_assignments_cover_every_index_once() {
        let live: Vec<i64> = vec![2, 4, 6, 9, 11];
        let mut indices: Vec<u32> = live
            .iter()
            .map(|&id| dynamic_assignment(&live, id).unwrap())
            .inspect(|a| assert_eq!(a.total_shard_count, 5))
            .map(|a| a.assigned_shard_index)
            .collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }
}
