use std::sync::Arc;

use tracing::debug;

use crate::store::{Store, StoreError};
use crate::types::{
    now_iso, AppState, AssignDecision, AssignParams, AssignPolicy, Worker, Workload, WorkerRole,
};

/// Picks an owner for a conversation and commits the assignment. The winner
/// is the first candidate with the lowest workload score under the policy,
/// in the stable ordering returned by the store.
pub async fn assign(
    state: &Arc<AppState>,
    conversation_id: &str,
    policy: AssignPolicy,
    params: &AssignParams,
) -> Result<AssignDecision, StoreError> {
    let policy = match policy {
        AssignPolicy::Priority => {
            if params.priority >= 7 {
                AssignPolicy::LoadBalancing
            } else {
                AssignPolicy::RoundRobin
            }
        }
        other => other,
    };

    let employees = state.store.active_workers(WorkerRole::Employee).await?;
    if employees.is_empty() {
        return Ok(AssignDecision::Skipped {
            reason: "no_active_employees",
        });
    }

    let workloads = state.store.workload_index().await?;
    let winner = pick_least_loaded(&employees, &workloads, policy);

    debug!(
        conversation_id,
        worker_id = winner.id.as_str(),
        policy = ?policy,
        "assignment candidate selected"
    );

    let winner_id = winner.id.clone();
    match state
        .store
        .assign_owner(conversation_id, &winner_id, &now_iso())
        .await?
    {
        Some(conversation) => Ok(AssignDecision::Assigned {
            conversation,
            worker_id: winner_id,
        }),
        None => Ok(AssignDecision::Skipped {
            reason: "conversation_not_found",
        }),
    }
}

fn score(workloads: &std::collections::HashMap<String, Workload>, worker_id: &str, policy: AssignPolicy) -> i64 {
    let load = workloads.get(worker_id).copied().unwrap_or_default();
    match policy {
        AssignPolicy::RoundRobin => load.active_conversations,
        AssignPolicy::LoadBalancing => 2 * load.active_conversations + load.unread_total,
        AssignPolicy::Priority => load.active_conversations,
    }
}

/// Manual scan so that ties keep the first candidate in list order.
fn pick_least_loaded<'a>(
    employees: &'a [Worker],
    workloads: &std::collections::HashMap<String, Workload>,
    policy: AssignPolicy,
) -> &'a Worker {
    let mut best = &employees[0];
    let mut best_score = score(workloads, &best.id, policy);
    for candidate in &employees[1..] {
        let candidate_score = score(workloads, &candidate.id, policy);
        if candidate_score < best_score {
            best = candidate;
            best_score = candidate_score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::AppConfig;
    use crate::gateway::MockGateway;
    use crate::store::MemStore;

    fn worker(id: &str, created_at: &str) -> Worker {
        Worker {
            id: id.to_string(),
            name: format!("worker {id}"),
            role: WorkerRole::Employee,
            active: true,
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn tie_break_keeps_first_candidate() {
        let employees = vec![
            worker("a", "1"),
            worker("b", "2"),
            worker("c", "3"),
            worker("d", "4"),
        ];
        let mut workloads = HashMap::new();
        workloads.insert("a".to_string(), Workload { active_conversations: 3, unread_total: 0 });
        workloads.insert("b".to_string(), Workload { active_conversations: 1, unread_total: 0 });
        workloads.insert("c".to_string(), Workload { active_conversations: 4, unread_total: 0 });
        workloads.insert("d".to_string(), Workload { active_conversations: 1, unread_total: 0 });

        let winner = pick_least_loaded(&employees, &workloads, AssignPolicy::RoundRobin);
        assert_eq!(winner.id, "b");
    }

    #[test]
    fn load_balancing_picks_first_lowest_score() {
        let employees = vec![
            worker("a", "1"),
            worker("b", "2"),
            worker("c", "3"),
            worker("d", "4"),
        ];
        // scores 3, 1, 4, 1 under 2*active + unread
        let mut workloads = HashMap::new();
        workloads.insert("a".to_string(), Workload { active_conversations: 1, unread_total: 1 });
        workloads.insert("b".to_string(), Workload { active_conversations: 0, unread_total: 1 });
        workloads.insert("c".to_string(), Workload { active_conversations: 2, unread_total: 0 });
        workloads.insert("d".to_string(), Workload { active_conversations: 0, unread_total: 1 });

        let winner = pick_least_loaded(&employees, &workloads, AssignPolicy::LoadBalancing);
        assert_eq!(winner.id, "b");
    }

    #[test]
    fn load_balancing_weighs_unread() {
        let employees = vec![worker("a", "1"), worker("b", "2")];
        let mut workloads = HashMap::new();
        workloads.insert("a".to_string(), Workload { active_conversations: 1, unread_total: 9 });
        workloads.insert("b".to_string(), Workload { active_conversations: 2, unread_total: 1 });

        // round robin would pick a (fewer conversations), load balancing b
        let winner = pick_least_loaded(&employees, &workloads, AssignPolicy::RoundRobin);
        assert_eq!(winner.id, "a");
        let winner = pick_least_loaded(&employees, &workloads, AssignPolicy::LoadBalancing);
        assert_eq!(winner.id, "b");
    }

    #[tokio::test]
    async fn skips_when_no_active_employees() {
        let store = std::sync::Arc::new(MemStore::new());
        let state = Arc::new(AppState::new(
            store,
            std::sync::Arc::new(MockGateway::new()),
            AppConfig::default(),
        ));
        let decision = assign(&state, "c1", AssignPolicy::RoundRobin, &AssignParams::default())
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AssignDecision::Skipped { reason: "no_active_employees" }
        ));
    }

    #[tokio::test]
    async fn priority_policy_delegates_by_threshold() {
        let store = std::sync::Arc::new(MemStore::new());
        store.seed_worker(worker("a", "1")).await;
        let state = Arc::new(AppState::new(
            store.clone(),
            std::sync::Arc::new(MockGateway::new()),
            AppConfig::default(),
        ));
        let conversation = store.find_or_create_conversation("9665550001").await.unwrap();

        let decision = assign(
            &state,
            &conversation.id,
            AssignPolicy::Priority,
            &AssignParams { priority: 9 },
        )
        .await
        .unwrap();
        assert!(matches!(
            decision,
            AssignDecision::Assigned { worker_id, .. } if worker_id == "a"
        ));
    }
}
