use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use agentgate_chain::AppendLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    Claimed,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub created_at_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ns: Option<u64>,
    pub tags: Vec<String>,
    pub skills: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("task not found")]
    NotFound,
    #[error("not_available")]
    NotAvailable,
    #[error("task cannot be completed from its current status")]
    NotCompletable,
    #[error("task cannot be cancelled from its current status")]
    NotCancellable,
}

impl From<TaskError> for crate::errors::ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound => crate::errors::ApiError::NotFound("task not found".to_string()),
            TaskError::NotAvailable
            | TaskError::NotCompletable
            | TaskError::NotCancellable => crate::errors::ApiError::Conflict(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub agent: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |status| task.status == status)
            && self.priority.map_or(true, |priority| task.priority == priority)
            && self
                .agent
                .as_deref()
                .map_or(true, |agent| task.agent.as_deref() == Some(agent))
    }
}

/// Priority-ordered task marketplace. Tasks themselves live in a map;
/// every lifecycle transition also lands in the store's own lineage
/// chain, so task history shares the audit chain's tamper evidence.
pub struct TaskStore {
    tasks: Mutex<Vec<Task>>,
    lineage: AppendLog,
}

impl TaskStore {
    pub fn new(lineage: AppendLog) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            lineage,
        }
    }

    pub fn create(&self, new: NewTask) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Available,
            agent: None,
            created_at_ns: now_ns(),
            claimed_at_ns: None,
            completed_at_ns: None,
            tags: new.tags,
            skills: new.skills,
            summary: None,
        };
        self.tasks.lock().push(task.clone());
        self.record(json!({
            "event": "created",
            "task_id": task.id,
            "title": task.title,
            "priority": task.priority,
        }));
        task
    }

    pub fn claim(&self, id: &str, agent: &str) -> Result<Task, TaskError> {
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|task| task.id == id)
                .ok_or(TaskError::NotFound)?;
            if task.status != TaskStatus::Available {
                return Err(TaskError::NotAvailable);
            }
            task.status = TaskStatus::Claimed;
            task.agent = Some(agent.to_string());
            task.claimed_at_ns = Some(now_ns());
            task.clone()
        };
        self.record(json!({
            "event": "claimed",
            "task_id": task.id,
            "agent": agent,
        }));
        Ok(task)
    }

    pub fn complete(
        &self,
        id: &str,
        agent: &str,
        summary: Option<String>,
    ) -> Result<Task, TaskError> {
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|task| task.id == id)
                .ok_or(TaskError::NotFound)?;
            if !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress) {
                return Err(TaskError::NotCompletable);
            }
            task.status = TaskStatus::Completed;
            task.agent = Some(agent.to_string());
            task.completed_at_ns = Some(now_ns());
            task.summary = summary.clone();
            task.clone()
        };
        self.record(json!({
            "event": "completed",
            "task_id": task.id,
            "agent": agent,
            "summary": summary,
        }));
        Ok(task)
    }

    pub fn cancel(&self, id: &str) -> Result<Task, TaskError> {
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .iter_mut()
                .find(|task| task.id == id)
                .ok_or(TaskError::NotFound)?;
            if task.status != TaskStatus::Available {
                return Err(TaskError::NotCancellable);
            }
            task.status = TaskStatus::Cancelled;
            task.clone()
        };
        self.record(json!({
            "event": "cancelled",
            "task_id": task.id,
        }));
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().iter().find(|task| task.id == id).cloned()
    }

    /// Priority descending (critical first), then creation time ascending.
    pub fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> (Vec<Task>, usize) {
        let tasks = self.tasks.lock();
        let mut matching: Vec<Task> = tasks
            .iter()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at_ns.cmp(&b.created_at_ns))
        });
        let total = matching.len();
        let page = matching.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    pub fn lineage(&self) -> &AppendLog {
        &self.lineage
    }

    fn record(&self, content: serde_json::Value) {
        if let Err(err) = self.lineage.append(content) {
            tracing::warn!(error = %err, "task lineage append failed");
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(AppendLog::in_memory())
    }

    fn new_task(title: &str, priority: Priority) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            priority,
            tags: vec![],
            skills: vec![],
        }
    }

    #[test]
    fn lifecycle_claim_then_complete() {
        let store = store();
        let task = store.create(new_task("T", Priority::High));
        assert_eq!(task.status, TaskStatus::Available);

        let claimed = store.claim(&task.id, "agent-a").unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.agent.as_deref(), Some("agent-a"));

        let err = store.claim(&task.id, "agent-b").unwrap_err();
        assert_eq!(err, TaskError::NotAvailable);

        let completed = store
            .complete(&task.id, "agent-a", Some("done".into()))
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.summary.as_deref(), Some("done"));
        assert!(completed.completed_at_ns.is_some());
    }

    #[test]
    fn complete_requires_claimed_or_in_progress() {
        let store = store();
        let task = store.create(new_task("T", Priority::Low));
        let err = store.complete(&task.id, "a", None).unwrap_err();
        assert_eq!(err, TaskError::NotCompletable);
    }

    #[test]
    fn cancel_only_from_available() {
        let store = store();
        let task = store.create(new_task("T", Priority::Low));
        store.claim(&task.id, "a").unwrap();
        assert_eq!(store.cancel(&task.id).unwrap_err(), TaskError::NotCancellable);

        let other = store.create(new_task("U", Priority::Low));
        let cancelled = store.cancel(&other.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        // No retrograde transitions out of a terminal state.
        assert_eq!(store.claim(&other.id, "a").unwrap_err(), TaskError::NotAvailable);
    }

    #[test]
    fn unknown_task_reports_not_found() {
        let store = store();
        assert_eq!(store.claim("missing", "a").unwrap_err(), TaskError::NotFound);
        assert_eq!(
            store.complete("missing", "a", None).unwrap_err(),
            TaskError::NotFound
        );
    }

    #[test]
    fn listing_orders_priority_desc_then_created_asc() {
        let store = store();
        let low = store.create(new_task("low", Priority::Low));
        let critical = store.create(new_task("critical", Priority::Critical));
        let high_first = store.create(new_task("high-1", Priority::High));
        let high_second = store.create(new_task("high-2", Priority::High));

        let (tasks, total) = store.list(&TaskFilter::default(), 10, 0);
        assert_eq!(total, 4);
        let ids: Vec<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                critical.id.as_str(),
                high_first.id.as_str(),
                high_second.id.as_str(),
                low.id.as_str()
            ]
        );
    }

    #[test]
    fn filters_and_pagination() {
        let store = store();
        for index in 0..4 {
            let task = store.create(new_task(&format!("t{index}"), Priority::Medium));
            if index % 2 == 0 {
                store.claim(&task.id, "agent-a").unwrap();
            }
        }

        let filter = TaskFilter {
            status: Some(TaskStatus::Claimed),
            ..TaskFilter::default()
        };
        let (tasks, total) = store.list(&filter, 1, 1);
        assert_eq!(total, 2);
        assert_eq!(tasks.len(), 1);

        let filter = TaskFilter {
            agent: Some("agent-a".into()),
            ..TaskFilter::default()
        };
        let (_, total) = store.list(&filter, 10, 0);
        assert_eq!(total, 2);
    }

    #[test]
    fn lineage_records_every_transition() {
        let store = store();
        let task = store.create(new_task("T", Priority::High));
        store.claim(&task.id, "a").unwrap();
        store.complete(&task.id, "a", Some("done".into())).unwrap();

        assert_eq!(store.lineage().len(), 3);
        assert!(store.lineage().verify().valid);

        let (records, _) = store
            .lineage()
            .list(&agentgate_chain::ListFilter::default(), 10, 0);
        let events: Vec<&str> = records
            .iter()
            .map(|record| record.content["event"].as_str().unwrap())
            .collect();
        assert_eq!(events, vec!["created", "claimed", "completed"]);
    }
}
