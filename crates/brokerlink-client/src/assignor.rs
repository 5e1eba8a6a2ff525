//! Range Assignment Strategy
//!
//! Run by the group leader after every join to split partitions among members.
//!
//! # Algorithm
//!
//! For each topic independently:
//! 1. Sort the members subscribed to the topic by member id
//! 2. Base range size: `partitions / members`
//! 3. The first `partitions % members` members get one extra partition
//! 4. Hand out contiguous ranges in member order
//!
//! With 7 partitions and 3 members: `[0, 1, 2]`, `[3, 4]`, `[5, 6]`.

use std::collections::BTreeMap;

use brokerlink_core::protocol::{GroupMember, MemberAssignment};
use brokerlink_core::TopicPartition;

/// Range-assign `partition_counts` (topic → partition count) to `members`.
///
/// Every member appears in the result, possibly with no partitions. Topics no
/// member subscribes to are skipped.
pub fn range_assign(
    members: &[GroupMember],
    partition_counts: &BTreeMap<String, usize>,
) -> Vec<MemberAssignment> {
    let mut result: BTreeMap<String, Vec<TopicPartition>> = members
        .iter()
        .map(|m| (m.member_id.clone(), Vec::new()))
        .collect();

    for (topic, &partition_count) in partition_counts {
        let mut subscribed: Vec<&str> = members
            .iter()
            .filter(|m| m.topics.iter().any(|t| t == topic))
            .map(|m| m.member_id.as_str())
            .collect();
        if subscribed.is_empty() || partition_count == 0 {
            continue;
        }
        subscribed.sort_unstable();
        subscribed.dedup();

        let base_range = partition_count / subscribed.len();
        let extra = partition_count % subscribed.len();
        let mut next = 0;

        for (idx, member_id) in subscribed.iter().enumerate() {
            let range_size = base_range + usize::from(idx < extra);
            if let Some(assigned) = result.get_mut(*member_id) {
                assigned.extend(
                    (next..next + range_size).map(|p| TopicPartition::new(topic.clone(), p as i32)),
                );
            }
            next += range_size;
        }
    }

    result
        .into_iter()
        .map(|(member_id, partitions)| MemberAssignment {
            member_id,
            partitions,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, topics: &[&str]) -> GroupMember {
        GroupMember {
            member_id: id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn counts(topics: &[(&str, usize)]) -> BTreeMap<String, usize> {
        topics.iter().map(|(t, n)| (t.to_string(), *n)).collect()
    }

    fn partitions_of(result: &[MemberAssignment], member_id: &str, topic: &str) -> Vec<i32> {
        result
            .iter()
            .find(|a| a.member_id == member_id)
            .map(|a| {
                a.partitions
                    .iter()
                    .filter(|tp| tp.topic == topic)
                    .map(|tp| tp.partition)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_even_distribution() {
        let members = vec![
            member("member-3", &["orders"]),
            member("member-1", &["orders"]),
            member("member-2", &["orders"]),
        ];
        let result = range_assign(&members, &counts(&[("orders", 6)]));

        assert_eq!(partitions_of(&result, "member-1", "orders"), vec![0, 1]);
        assert_eq!(partitions_of(&result, "member-2", "orders"), vec![2, 3]);
        assert_eq!(partitions_of(&result, "member-3", "orders"), vec![4, 5]);
    }

    #[test]
    fn test_uneven_distribution() {
        let members = vec![
            member("a", &["orders"]),
            member("b", &["orders"]),
            member("c", &["orders"]),
        ];
        let result = range_assign(&members, &counts(&[("orders", 7)]));

        assert_eq!(partitions_of(&result, "a", "orders"), vec![0, 1, 2]);
        assert_eq!(partitions_of(&result, "b", "orders"), vec![3, 4]);
        assert_eq!(partitions_of(&result, "c", "orders"), vec![5, 6]);
    }

    #[test]
    fn test_more_members_than_partitions() {
        let members = vec![member("a", &["orders"]), member("b", &["orders"]), member("c", &["orders"])];
        let result = range_assign(&members, &counts(&[("orders", 2)]));

        assert_eq!(result.len(), 3);
        assert_eq!(partitions_of(&result, "a", "orders"), vec![0]);
        assert_eq!(partitions_of(&result, "b", "orders"), vec![1]);
        assert!(partitions_of(&result, "c", "orders").is_empty());
    }

    #[test]
    fn test_topics_assigned_independently() {
        let members = vec![member("a", &["orders", "events"]), member("b", &["orders"])];
        let result = range_assign(&members, &counts(&[("orders", 2), ("events", 3)]));

        assert_eq!(partitions_of(&result, "a", "orders"), vec![0]);
        assert_eq!(partitions_of(&result, "b", "orders"), vec![1]);
        assert_eq!(partitions_of(&result, "a", "events"), vec![0, 1, 2]);
        assert!(partitions_of(&result, "b", "events").is_empty());
    }
}
