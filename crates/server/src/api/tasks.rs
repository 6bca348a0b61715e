use axum::extract::State;
use axum::Json;
use gridserve_core::queue::{self, TaskResult};
use gridserve_core::CoreError;
use gridserve_models::{Id, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SharedApp;
use crate::api::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub manager_name: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub programs: Vec<String>,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct ClaimedTaskResponse {
    pub record_id: Id,
    pub function: Value,
    pub tag: String,
    pub priority: Priority,
}

pub async fn claim_tasks(
    State(app): State<SharedApp>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Vec<ClaimedTaskResponse>>, ApiError> {
    if req.limit > app.config.claim_limit_cap {
        return Err(CoreError::LimitExceeded {
            limit: app.config.claim_limit_cap as usize,
            actual: req.limit as usize,
        }
        .into());
    }

    let mut tx = app.pool.begin().await.map_err(CoreError::from)?;
    let claimed = queue::claim(&mut tx, &req.manager_name, &req.tags, &req.programs, req.limit).await?;
    tx.commit().await.map_err(CoreError::from)?;

    Ok(Json(
        claimed
            .into_iter()
            .map(|t| ClaimedTaskResponse {
                record_id: t.record_id,
                function: t.function,
                tag: t.tag,
                priority: t.priority,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct TaskResultRequest {
    pub record_id: Id,
    pub success: bool,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub final_molecule: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnResultsRequest {
    pub manager_name: String,
    pub results: Vec<TaskResultRequest>,
}

pub async fn return_results(
    State(app): State<SharedApp>,
    Json(req): Json<ReturnResultsRequest>,
) -> Result<Json<()>, ApiError> {
    if req.results.len() as i64 > app.config.claim_limit_cap {
        return Err(CoreError::LimitExceeded {
            limit: app.config.claim_limit_cap as usize,
            actual: req.results.len(),
        }
        .into());
    }

    let mut tx = app.pool.begin().await.map_err(CoreError::from)?;

    let results = req
        .results
        .into_iter()
        .map(|r| TaskResult {
            record_id: r.record_id,
            success: r.success,
            stdout: r.stdout.map(String::into_bytes),
            stderr: r.stderr.map(String::into_bytes),
            error: r.error,
            final_molecule: r.final_molecule,
        })
        .collect();

    queue::return_results(&mut tx, &app.ids, &req.manager_name, results).await?;
    tx.commit().await.map_err(CoreError::from)?;

    Ok(Json(()))
}
