use axum::extract::{Path, State};
use axum::Json;
use gridserve_core::manager::{self, Activation};
use gridserve_core::CoreError;
use serde::Deserialize;

use super::SharedApp;
use crate::api::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub name: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub programs: Vec<String>,
}

pub async fn activate(
    State(app): State<SharedApp>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<manager::Manager>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    let activated = manager::activate(
        &mut conn,
        Activation {
            name: req.name,
            cluster: req.cluster,
            hostname: req.hostname,
            tags: req.tags,
            programs: req.programs,
        },
    )
    .await?;
    Ok(Json(activated))
}

pub async fn heartbeat(
    State(app): State<SharedApp>,
    Path(name): Path<String>,
) -> Result<Json<()>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    manager::heartbeat(&mut conn, &name).await?;
    Ok(Json(()))
}

pub async fn deactivate(
    State(app): State<SharedApp>,
    Path(name): Path<String>,
) -> Result<Json<()>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    manager::deactivate(&mut conn, &name).await?;
    Ok(Json(()))
}
