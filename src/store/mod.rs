//! Data-access collaborator for the realtime layer.
//!
//! The persistent store is the system of record for unread counts — the
//! in-memory presence state only decides whether a new message is stamped
//! read at write time, it never substitutes for re-querying here.
//!
//! rusqlite is synchronous, so every operation clones the pool and runs
//! inside tokio::task::spawn_blocking.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::db::models::{Message, Task, TaskChatGroup, TaskGroupMessage, TaskGroupReadState, User};
use crate::db::DbPool;

/// Maximum message content length (chars), DM and group alike.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Unread DM counts for one user, keyed by sender id.
/// Wire shape of the `unread:update` payload.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    pub total: i64,
    pub by_user: HashMap<String, i64>,
}

/// Unread task-group message counts for one user, keyed by task id.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUnreadCounts {
    pub total: i64,
    pub by_task: HashMap<String, i64>,
}

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    Lock,
    Join,
    Db(rusqlite::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Lock => write!(f, "database lock poisoned"),
            StoreError::Join => write!(f, "blocking task failed"),
            StoreError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Db(e)
    }
}

/// Current time in the fixed-width RFC 3339 format used everywhere in the
/// schema. Fixed width keeps lexicographic comparison valid in SQL.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Narrow data-access interface consumed by the realtime core and the chat
/// REST surface. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: DbPool,
}

impl Store {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run a closure against the locked connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::Lock)?;
            f(&conn)
        })
        .await
        .map_err(|_| StoreError::Join)?
    }

    // --- Users ---

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, name, email, role, created_at FROM users WHERE id = ?1",
                    params![id],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// All users except the given one — the DM roster.
    pub async fn get_users_except(&self, id: i64) -> Result<Vec<User>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role, created_at FROM users WHERE id != ?1 ORDER BY id",
            )?;
            let users = stmt
                .query_map(params![id], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    pub async fn create_user(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, StoreError> {
        let name = name.to_string();
        let email = email.to_string();
        let password_hash = format!("{:x}", Sha256::digest(password.as_bytes()));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (name, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, email, password_hash, now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let user = conn.query_row(
                "SELECT id, name, email, role, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )?;
            Ok(user)
        })
        .await
    }

    // --- Tasks ---

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            let task = conn
                .query_row(
                    "SELECT id, title, description, status, priority, completed,
                            assigned_to_id, assigned_to_ids, created_by_id, created_at
                     FROM tasks WHERE id = ?1",
                    params![id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    pub async fn create_task(
        &self,
        title: &str,
        created_by_id: i64,
        assigned_to_ids: &[i64],
    ) -> Result<Task, StoreError> {
        let title = title.to_string();
        let ids_json = serde_json::to_string(assigned_to_ids).unwrap_or_else(|_| "[]".to_string());
        let first = assigned_to_ids.first().copied();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (title, assigned_to_id, assigned_to_ids, created_by_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![title, first, ids_json, created_by_id, now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let task = conn.query_row(
                "SELECT id, title, description, status, priority, completed,
                        assigned_to_id, assigned_to_ids, created_by_id, created_at
                 FROM tasks WHERE id = ?1",
                params![id],
                task_from_row,
            )?;
            Ok(task)
        })
        .await
    }

    // --- Direct messages ---

    pub async fn messages_between(
        &self,
        user_id: i64,
        other_user_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_user_id, to_user_id, content, read_at, created_at
                 FROM messages
                 WHERE (from_user_id = ?1 AND to_user_id = ?2)
                    OR (from_user_id = ?2 AND to_user_id = ?1)
                 ORDER BY created_at ASC, id ASC",
            )?;
            let messages = stmt
                .query_map(params![user_id, other_user_id], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// Persist a DM. `read_at` is set at creation when the recipient is
    /// already viewing the sender's conversation (no unread flash).
    pub async fn create_message(
        &self,
        from_user_id: i64,
        to_user_id: i64,
        content: &str,
        read_at: Option<String>,
    ) -> Result<Message, StoreError> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (from_user_id, to_user_id, content, read_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![from_user_id, to_user_id, content, read_at, now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let message = conn.query_row(
                "SELECT id, from_user_id, to_user_id, content, read_at, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                message_from_row,
            )?;
            Ok(message)
        })
        .await
    }

    /// Mark every unread message from `peer_user_id` to `viewer_user_id` as
    /// read. Returns the number of rows that changed.
    pub async fn mark_messages_as_read(
        &self,
        viewer_user_id: i64,
        peer_user_id: i64,
    ) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE from_user_id = ?2 AND to_user_id = ?3 AND read_at IS NULL",
                params![now_rfc3339(), peer_user_id, viewer_user_id],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Unread DM counts, recomputed from `read_at IS NULL` — never cached.
    pub async fn unread_counts_for_user(&self, user_id: i64) -> Result<UnreadCounts, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT from_user_id, COUNT(*) FROM messages
                 WHERE to_user_id = ?1 AND read_at IS NULL
                 GROUP BY from_user_id",
            )?;
            let mut counts = UnreadCounts::default();
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (from, count) = row?;
                counts.total += count;
                counts.by_user.insert(from.to_string(), count);
            }
            Ok(counts)
        })
        .await
    }

    // --- Task chat groups ---

    pub async fn get_task_chat_group(
        &self,
        task_id: i64,
    ) -> Result<Option<TaskChatGroup>, StoreError> {
        self.with_conn(move |conn| {
            let group = conn
                .query_row(
                    "SELECT id, task_id, created_by_id, created_at
                     FROM task_chat_groups WHERE task_id = ?1",
                    params![task_id],
                    group_from_row,
                )
                .optional()?;
            Ok(group)
        })
        .await
    }

    /// Get or lazily create the chat group for a task.
    /// Returns the group and whether this call created it.
    pub async fn ensure_task_chat_group(
        &self,
        task_id: i64,
        created_by_id: i64,
    ) -> Result<(TaskChatGroup, bool), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO task_chat_groups (task_id, created_by_id, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (task_id) DO NOTHING",
                params![task_id, created_by_id, now_rfc3339()],
            )?;
            let group = conn.query_row(
                "SELECT id, task_id, created_by_id, created_at
                 FROM task_chat_groups WHERE task_id = ?1",
                params![task_id],
                group_from_row,
            )?;
            Ok((group, inserted > 0))
        })
        .await
    }

    /// All task chat groups joined with their tasks, oldest first.
    pub async fn task_chat_groups(&self) -> Result<Vec<(TaskChatGroup, Task)>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.task_id, g.created_by_id, g.created_at,
                        t.id, t.title, t.description, t.status, t.priority, t.completed,
                        t.assigned_to_id, t.assigned_to_ids, t.created_by_id, t.created_at
                 FROM task_chat_groups g
                 JOIN tasks t ON t.id = g.task_id
                 ORDER BY g.created_at ASC, g.id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let group = TaskChatGroup {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        created_by_id: row.get(2)?,
                        created_at: row.get(3)?,
                    };
                    let task = Task {
                        id: row.get(4)?,
                        title: row.get(5)?,
                        description: row.get(6)?,
                        status: row.get(7)?,
                        priority: row.get(8)?,
                        completed: row.get::<_, i64>(9)? != 0,
                        assigned_to_id: row.get(10)?,
                        assigned_to_ids: parse_id_list(row.get::<_, Option<String>>(11)?),
                        created_by_id: row.get(12)?,
                        created_at: row.get(13)?,
                    };
                    Ok((group, task))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn task_group_messages(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskGroupMessage>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, from_user_id, content, created_at
                 FROM task_group_messages WHERE task_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let messages = stmt
                .query_map(params![task_id], |row| {
                    Ok(TaskGroupMessage {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        from_user_id: row.get(2)?,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    pub async fn create_task_group_message(
        &self,
        task_id: i64,
        from_user_id: i64,
        content: &str,
    ) -> Result<TaskGroupMessage, StoreError> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_group_messages (task_id, from_user_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, from_user_id, content, now_rfc3339()],
            )?;
            let id = conn.last_insert_rowid();
            let message = conn.query_row(
                "SELECT id, task_id, from_user_id, content, created_at
                 FROM task_group_messages WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TaskGroupMessage {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        from_user_id: row.get(2)?,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )?;
            Ok(message)
        })
        .await
    }

    pub async fn task_group_read_state(
        &self,
        user_id: i64,
        task_id: i64,
    ) -> Result<Option<TaskGroupReadState>, StoreError> {
        self.with_conn(move |conn| {
            let state = conn
                .query_row(
                    "SELECT id, task_id, user_id, last_read_at, updated_at
                     FROM task_group_read_states WHERE user_id = ?1 AND task_id = ?2",
                    params![user_id, task_id],
                    |row| {
                        Ok(TaskGroupReadState {
                            id: row.get(0)?,
                            task_id: row.get(1)?,
                            user_id: row.get(2)?,
                            last_read_at: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(state)
        })
        .await
    }

    pub async fn upsert_task_group_read_state(
        &self,
        user_id: i64,
        task_id: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO task_group_read_states (task_id, user_id, last_read_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (user_id, task_id)
                 DO UPDATE SET last_read_at = ?3, updated_at = ?3",
                params![task_id, user_id, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Unread group-message counts for every group the user participates in.
    /// A message counts as unread when it is newer than the user's
    /// last_read_at watermark (everything counts when no watermark exists)
    /// and was not sent by the user themselves.
    pub async fn task_group_unread_counts(
        &self,
        user_id: i64,
    ) -> Result<GroupUnreadCounts, StoreError> {
        let groups = self.task_chat_groups().await?;
        self.with_conn(move |conn| {
            let mut counts = GroupUnreadCounts::default();
            for (group, task) in groups {
                if !task.participant_ids().contains(&user_id) {
                    continue;
                }
                let last_read: Option<String> = conn
                    .query_row(
                        "SELECT last_read_at FROM task_group_read_states
                         WHERE user_id = ?1 AND task_id = ?2",
                        params![user_id, group.task_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM task_group_messages
                     WHERE task_id = ?1 AND from_user_id != ?2
                       AND created_at > COALESCE(?3, '')",
                    params![group.task_id, user_id, last_read],
                    |row| row.get(0),
                )?;
                if count > 0 {
                    counts.total += count;
                    counts.by_task.insert(group.task_id.to_string(), count);
                }
            }
            Ok(counts)
        })
        .await
    }

    // --- Seeding ---

    /// First-boot seed: two users and two tasks, only when the users table
    /// is empty.
    pub async fn seed_if_empty(&self) -> Result<(), StoreError> {
        let existing: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .await?;
        if existing > 0 {
            return Ok(());
        }

        let alice = self
            .create_user("Alice Smith", "alice@example.com", "changeme")
            .await?;
        let bob = self
            .create_user("Bob Johnson", "bob@example.com", "changeme")
            .await?;
        self.create_task("Initial Setup", bob.id, &[alice.id]).await?;
        self.create_task("Review Design", alice.id, &[bob.id]).await?;
        tracing::info!("Database seeded with users and tasks");
        Ok(())
    }
}

// --- Row mappers ---

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        completed: row.get::<_, i64>(5)? != 0,
        assigned_to_id: row.get(6)?,
        assigned_to_ids: parse_id_list(row.get::<_, Option<String>>(7)?),
        created_by_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        from_user_id: row.get(1)?,
        to_user_id: row.get(2)?,
        content: row.get(3)?,
        read_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskChatGroup> {
    Ok(TaskChatGroup {
        id: row.get(0)?,
        task_id: row.get(1)?,
        created_by_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// assigned_to_ids is stored as a JSON array in a TEXT column.
fn parse_id_list(raw: Option<String>) -> Vec<i64> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str::<Vec<i64>>(s).ok())
        .unwrap_or_default()
}
