//! Task chat group REST surface.
//!
//! Every task owns at most one chat group, created lazily. Membership is
//! derived from the task itself (creator plus assignees) rather than stored
//! on the group, so reassigning a task moves its chat audience with it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::db::models::{Task, TaskChatGroup, TaskGroupMessage};
use crate::state::AppState;
use crate::store::{GroupUnreadCounts, StoreError, MAX_CONTENT_LENGTH};
use crate::ws::broadcast::emit;
use crate::ws::protocol::ServerEvent;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupWithTask {
    pub group: TaskChatGroup,
    pub task: Task,
    pub participant_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SendGroupMessageRequest {
    pub content: String,
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Store operation failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// POST /api/chats/groups/task/{taskId} — get or create the task's chat group.
/// Only participants may open the group. Returns 201 with the group either
/// way; creation is announced to every participant.
pub async fn ensure_group(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<i64>,
) -> Result<(StatusCode, Json<TaskChatGroup>), StatusCode> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let participants = task.participant_ids();
    if !participants.contains(&user_id) {
        return Err(StatusCode::FORBIDDEN);
    }

    let (group, created) = state
        .store
        .ensure_task_chat_group(task_id, user_id)
        .await
        .map_err(internal)?;

    if created {
        tracing::info!(task_id, user_id, "Task chat group created");
        for participant in &participants {
            emit(
                &state.connections,
                *participant,
                &ServerEvent::TaskGroupCreated { task_id },
            );
        }
    }

    Ok((StatusCode::CREATED, Json(group)))
}

/// GET /api/chats/groups — every group whose task the caller participates in.
pub async fn list_groups(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<GroupWithTask>>, StatusCode> {
    let groups = state.store.task_chat_groups().await.map_err(internal)?;
    let visible = groups
        .into_iter()
        .filter_map(|(group, task)| {
            let participant_ids = task.participant_ids();
            participant_ids.contains(&user_id).then_some(GroupWithTask {
                group,
                task,
                participant_ids,
            })
        })
        .collect();
    Ok(Json(visible))
}

/// GET /api/chats/groups/unread — unread group-message counts per task.
pub async fn get_group_unread_counts(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<GroupUnreadCounts>, StatusCode> {
    let counts = state
        .store
        .task_group_unread_counts(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(counts))
}

/// GET /api/chats/groups/task/{taskId}/messages — group history, oldest first.
pub async fn get_group_messages(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<i64>,
) -> Result<Json<Vec<TaskGroupMessage>>, StatusCode> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !task.participant_ids().contains(&user_id) {
        return Err(StatusCode::FORBIDDEN);
    }
    if state
        .store
        .get_task_chat_group(task_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let messages = state
        .store
        .task_group_messages(task_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

/// POST /api/chats/groups/task/{taskId}/messages — post to the group.
/// Creates the group on first use so a participant never hits a 404 racing
/// another participant's first message.
pub async fn send_group_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<i64>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<(StatusCode, Json<TaskGroupMessage>), StatusCode> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let participants = task.participant_ids();
    if !participants.contains(&user_id) {
        return Err(StatusCode::FORBIDDEN);
    }

    let (_, created) = state
        .store
        .ensure_task_chat_group(task_id, user_id)
        .await
        .map_err(internal)?;
    if created {
        for participant in &participants {
            emit(
                &state.connections,
                *participant,
                &ServerEvent::TaskGroupCreated { task_id },
            );
        }
    }

    let message = state
        .store
        .create_task_group_message(task_id, user_id, content)
        .await
        .map_err(internal)?;

    for participant in &participants {
        if *participant == user_id {
            continue;
        }
        emit(
            &state.connections,
            *participant,
            &ServerEvent::TaskGroupNew {
                task_id,
                from_user_id: user_id,
            },
        );
    }

    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/chats/groups/task/{taskId}/read — advance the caller's read
/// watermark to now. Echoed back to the caller's other tabs.
pub async fn mark_group_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(task_id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !task.participant_ids().contains(&user_id) {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .store
        .upsert_task_group_read_state(user_id, task_id)
        .await
        .map_err(internal)?;

    emit(
        &state.connections,
        user_id,
        &ServerEvent::TaskGroupRead { task_id },
    );

    Ok(Json(json!({ "success": true })))
}
