//! Consumer group coordinator
//!
//! Tracks group membership, generations, leader-computed assignments and committed
//! offsets for the simulated cluster.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use brokerlink_core::protocol::{
    GroupMember, JoinGroupRequest, JoinGroupResponse, MemberAssignment, OffsetCommitRequest,
    SyncGroupRequest, SyncGroupResponse,
};
use brokerlink_core::{BrokerError, TopicPartition};
use tracing::{debug, info};

/// Consumer group state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Group has no members
    Empty,
    /// Waiting for the leader to provide assignments
    CompletingRebalance,
    /// Group is stable with valid assignments
    Stable,
}

#[derive(Debug, Clone)]
struct Member {
    topics: Vec<String>,
    session_timeout: Duration,
    last_seen: Instant,
}

#[derive(Debug)]
pub(crate) struct ConsumerGroup {
    group_id: String,
    state: GroupState,
    generation: i32,
    leader_id: Option<String>,
    members: BTreeMap<String, Member>,
    assignments: HashMap<String, Vec<TopicPartition>>,
    offsets: BTreeMap<TopicPartition, i64>,
    next_member: u64,
}

impl ConsumerGroup {
    fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            state: GroupState::Empty,
            generation: 0,
            leader_id: None,
            members: BTreeMap::new(),
            assignments: HashMap::new(),
            offsets: BTreeMap::new(),
            next_member: 0,
        }
    }

    fn transition_to(&mut self, new_state: GroupState) {
        debug!(
            group_id = %self.group_id,
            from = ?self.state,
            to = ?new_state,
            generation = self.generation,
            "Group state transition"
        );
        self.state = new_state;
    }

    /// Start a new generation; every current member must sync again.
    fn begin_rebalance(&mut self) {
        self.generation += 1;
        self.assignments.clear();
        if self.members.is_empty() {
            self.leader_id = None;
            self.transition_to(GroupState::Empty);
            return;
        }
        let leader_present = self
            .leader_id
            .as_ref()
            .is_some_and(|id| self.members.contains_key(id));
        if !leader_present {
            self.leader_id = self.members.keys().next().cloned();
        }
        self.transition_to(GroupState::CompletingRebalance);
    }

    fn expire_members(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            info!(group_id = %self.group_id, member_id = %id, "Member session expired");
            self.members.remove(id);
        }
        self.begin_rebalance();
    }

    fn check_member(&self, member_id: &str, generation: i32) -> Result<(), BrokerError> {
        if !self.members.contains_key(member_id) {
            return Err(BrokerError::UnknownMember {
                group_id: self.group_id.clone(),
                member_id: member_id.to_string(),
            });
        }
        if generation != self.generation {
            return Err(BrokerError::IllegalGeneration {
                group_id: self.group_id.clone(),
                generation,
            });
        }
        Ok(())
    }

    fn touch(&mut self, member_id: &str) {
        if let Some(member) = self.members.get_mut(member_id) {
            member.last_seen = Instant::now();
        }
    }
}

/// Group coordinator for every group hosted by the simulated cluster.
#[derive(Debug, Default)]
pub(crate) struct GroupCoordinator {
    groups: HashMap<String, ConsumerGroup>,
}

impl GroupCoordinator {
    fn group_mut(&mut self, group_id: &str) -> &mut ConsumerGroup {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| ConsumerGroup::new(group_id))
    }

    pub(crate) fn join_group(&mut self, request: JoinGroupRequest) -> JoinGroupResponse {
        let group = self.group_mut(&request.group_id);
        let now = Instant::now();
        group.expire_members(now);

        let member_id = match request.member_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                group.next_member += 1;
                format!("{}-{}", request.client_id, group.next_member)
            }
        };

        let unchanged = group
            .members
            .get(&member_id)
            .is_some_and(|m| m.topics == request.topics);

        group.members.insert(
            member_id.clone(),
            Member {
                topics: request.topics,
                session_timeout: Duration::from_millis(request.session_timeout_ms),
                last_seen: now,
            },
        );

        if !unchanged || group.state == GroupState::Empty {
            info!(
                group_id = %group.group_id,
                member_id = %member_id,
                "Member joined, starting rebalance"
            );
            group.begin_rebalance();
        }

        let leader_id = group.leader_id.clone().unwrap_or_default();
        let members = if leader_id == member_id {
            group
                .members
                .iter()
                .map(|(id, m)| GroupMember {
                    member_id: id.clone(),
                    topics: m.topics.clone(),
                })
                .collect()
        } else {
            vec![]
        };

        JoinGroupResponse {
            generation: group.generation,
            member_id,
            leader_id,
            members,
        }
    }

    pub(crate) fn sync_group(
        &mut self,
        request: SyncGroupRequest,
    ) -> Result<SyncGroupResponse, BrokerError> {
        let group = self.group_mut(&request.group_id);
        group.check_member(&request.member_id, request.generation)?;
        group.touch(&request.member_id);

        match group.state {
            GroupState::Empty => Err(BrokerError::UnknownMember {
                group_id: request.group_id,
                member_id: request.member_id,
            }),
            GroupState::CompletingRebalance => {
                if group.leader_id.as_deref() != Some(request.member_id.as_str()) {
                    return Err(BrokerError::RebalanceInProgress(request.group_id));
                }
                for MemberAssignment {
                    member_id,
                    partitions,
                } in request.assignments
                {
                    if group.members.contains_key(&member_id) {
                        group.assignments.insert(member_id, partitions);
                    }
                }
                group.transition_to(GroupState::Stable);
                Ok(SyncGroupResponse {
                    partitions: group
                        .assignments
                        .get(&request.member_id)
                        .cloned()
                        .unwrap_or_default(),
                })
            }
            GroupState::Stable => Ok(SyncGroupResponse {
                partitions: group
                    .assignments
                    .get(&request.member_id)
                    .cloned()
                    .unwrap_or_default(),
            }),
        }
    }

    pub(crate) fn heartbeat(
        &mut self,
        group_id: &str,
        generation: i32,
        member_id: &str,
    ) -> Result<(), BrokerError> {
        let group = self.group_mut(group_id);
        group.expire_members(Instant::now());
        group.check_member(member_id, generation)?;
        group.touch(member_id);
        match group.state {
            GroupState::Stable => Ok(()),
            _ => Err(BrokerError::RebalanceInProgress(group_id.to_string())),
        }
    }

    pub(crate) fn leave_group(&mut self, group_id: &str, member_id: &str) -> Result<(), BrokerError> {
        let group = self.group_mut(group_id);
        if group.members.remove(member_id).is_none() {
            return Err(BrokerError::UnknownMember {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
            });
        }
        info!(group_id = %group_id, member_id = %member_id, "Member left group");
        group.begin_rebalance();
        Ok(())
    }

    pub(crate) fn commit_offsets(&mut self, request: OffsetCommitRequest) -> Result<(), BrokerError> {
        let group = self.group_mut(&request.group_id);
        if request.generation >= 0 {
            group.check_member(&request.member_id, request.generation)?;
            group.touch(&request.member_id);
        }
        for (tp, offset) in request.offsets {
            group.offsets.insert(tp, offset);
        }
        Ok(())
    }

    pub(crate) fn fetch_offsets(
        &mut self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> BTreeMap<TopicPartition, i64> {
        let group = self.group_mut(group_id);
        partitions
            .iter()
            .filter_map(|tp| group.offsets.get(tp).map(|o| (tp.clone(), *o)))
            .collect()
    }

    pub(crate) fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.groups.get(group_id)?.offsets.get(tp).copied()
    }

    pub(crate) fn generation(&self, group_id: &str) -> Option<i32> {
        self.groups.get(group_id).map(|g| g.generation)
    }

    pub(crate) fn state(&self, group_id: &str) -> Option<GroupState> {
        self.groups.get(group_id).map(|g| g.state)
    }

    pub(crate) fn member_count(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map_or(0, |g| g.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(coord: &mut GroupCoordinator, member_id: Option<&str>) -> JoinGroupResponse {
        coord.join_group(JoinGroupRequest {
            group_id: "g".to_string(),
            member_id: member_id.map(String::from),
            client_id: "c".to_string(),
            session_timeout_ms: 30_000,
            topics: vec!["orders".to_string()],
        })
    }

    fn sync(
        coord: &mut GroupCoordinator,
        member_id: &str,
        generation: i32,
        assignments: Vec<MemberAssignment>,
    ) -> Result<SyncGroupResponse, BrokerError> {
        coord.sync_group(SyncGroupRequest {
            group_id: "g".to_string(),
            generation,
            member_id: member_id.to_string(),
            assignments,
        })
    }

    #[test]
    fn test_first_member_leads_and_stabilizes() {
        let mut coord = GroupCoordinator::default();
        let joined = join(&mut coord, None);
        assert!(joined.is_leader());
        assert_eq!(joined.generation, 1);
        assert_eq!(joined.members.len(), 1);

        let assigned = vec![MemberAssignment {
            member_id: joined.member_id.clone(),
            partitions: vec![TopicPartition::new("orders", 0)],
        }];
        let synced = sync(&mut coord, &joined.member_id, 1, assigned).unwrap();
        assert_eq!(synced.partitions.len(), 1);
        assert_eq!(coord.state("g"), Some(GroupState::Stable));
        coord.heartbeat("g", 1, &joined.member_id).unwrap();
    }

    #[test]
    fn test_second_member_triggers_rebalance() {
        let mut coord = GroupCoordinator::default();
        let a = join(&mut coord, None);
        sync(&mut coord, &a.member_id, a.generation, vec![]).unwrap();

        let b = join(&mut coord, None);
        assert!(!b.is_leader());
        assert_eq!(b.generation, 2);

        // Follower cannot sync until the leader hands out assignments
        let err = sync(&mut coord, &b.member_id, 2, vec![]).unwrap_err();
        assert!(matches!(err, BrokerError::RebalanceInProgress(_)));

        // Leader learns about the rebalance through its heartbeat
        let err = coord.heartbeat("g", 1, &a.member_id).unwrap_err();
        assert!(matches!(err, BrokerError::IllegalGeneration { .. }));

        let rejoined = join(&mut coord, Some(&a.member_id));
        assert_eq!(rejoined.generation, 2);
        assert_eq!(rejoined.members.len(), 2);
    }

    #[test]
    fn test_leave_rebalances_remaining_members() {
        let mut coord = GroupCoordinator::default();
        let a = join(&mut coord, None);
        let b = join(&mut coord, None);
        coord.leave_group("g", &a.member_id).unwrap();
        assert_eq!(coord.member_count("g"), 1);
        assert_eq!(coord.generation("g"), Some(3));

        let again = join(&mut coord, Some(&b.member_id));
        assert!(again.is_leader());

        assert!(coord.leave_group("g", "nobody").is_err());
    }

    #[test]
    fn test_commit_requires_current_generation() {
        let mut coord = GroupCoordinator::default();
        let a = join(&mut coord, None);
        let tp = TopicPartition::new("orders", 0);

        let stale = OffsetCommitRequest {
            group_id: "g".to_string(),
            generation: 0,
            member_id: a.member_id.clone(),
            offsets: BTreeMap::from([(tp.clone(), 5)]),
        };
        assert!(coord.commit_offsets(stale).is_err());

        let current = OffsetCommitRequest {
            group_id: "g".to_string(),
            generation: a.generation,
            member_id: a.member_id,
            offsets: BTreeMap::from([(tp.clone(), 5)]),
        };
        coord.commit_offsets(current).unwrap();
        assert_eq!(coord.committed("g", &tp), Some(5));
        assert_eq!(coord.fetch_offsets("g", &[tp.clone()]).get(&tp), Some(&5));
    }
}
