//! Database row types for all tables.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs.
//! Serialized shapes (camelCase) are part of the REST contract.

use serde::Serialize;

/// User record in the users table. The password hash is never selected
/// into this type — it stays inside the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub created_at: String,
}

/// Task record. Only the columns the realtime layer needs are mapped;
/// attachments and due dates belong to the task CRUD surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub completed: bool,
    pub assigned_to_id: Option<i64>,
    pub assigned_to_ids: Vec<i64>,
    pub created_by_id: Option<i64>,
    pub created_at: String,
}

impl Task {
    /// Everyone who may see this task's chat group: creator plus all assignees.
    pub fn participant_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        if let Some(creator) = self.created_by_id {
            ids.push(creator);
        }
        for id in &self.assigned_to_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        // Legacy single-assignee column as fallback
        if let Some(single) = self.assigned_to_id {
            if !ids.contains(&single) {
                ids.push(single);
            }
        }
        ids
    }
}

/// Direct message between two users. `read_at` is NULL while unread.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub content: String,
    pub read_at: Option<String>,
    pub created_at: String,
}

/// Implicit group conversation bound 1:1 to a task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChatGroup {
    pub id: i64,
    pub task_id: i64,
    pub created_by_id: i64,
    pub created_at: String,
}

/// Message in a task chat group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupMessage {
    pub id: i64,
    pub task_id: i64,
    pub from_user_id: i64,
    pub content: String,
    pub created_at: String,
}

/// Per-user watermark into a task group's message stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupReadState {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub last_read_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_ids_dedupes_creator_and_assignees() {
        let task = Task {
            id: 1,
            title: "t".into(),
            description: None,
            status: "todo".into(),
            priority: "medium".into(),
            completed: false,
            assigned_to_id: Some(2),
            assigned_to_ids: vec![2, 3],
            created_by_id: Some(3),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        };
        assert_eq!(task.participant_ids(), vec![3, 2]);
    }
}
