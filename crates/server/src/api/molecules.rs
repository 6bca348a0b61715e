use axum::extract::{Path, State};
use axum::Json;
use gridserve_core::molecule::{self, MoleculeInput};
use gridserve_models::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SharedApp;
use crate::api::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MoleculeEntry {
    Existing { existing: Id },
    Literal(Value),
}

#[derive(Debug, Deserialize)]
pub struct AddMoleculesRequest {
    pub molecules: Vec<MoleculeEntry>,
}

#[derive(Debug, Serialize)]
pub struct AddMoleculesResponse {
    pub ids: Vec<Option<Id>>,
    pub inserted_idx: Vec<usize>,
    pub existing_idx: Vec<usize>,
    pub errors: Vec<(usize, String)>,
}

pub async fn add_molecules(
    State(app): State<SharedApp>,
    Json(req): Json<AddMoleculesRequest>,
) -> Result<Json<AddMoleculesResponse>, ApiError> {
    let inputs = req
        .molecules
        .into_iter()
        .map(|entry| match entry {
            MoleculeEntry::Existing { existing } => MoleculeInput::Existing(existing),
            MoleculeEntry::Literal(doc) => MoleculeInput::Literal(doc),
        })
        .collect();

    let mut conn = app.pool.acquire().await.map_err(gridserve_core::CoreError::from)?;
    let (meta, ids) = molecule::add_mixed(&mut conn, &app.ids, inputs).await?;

    Ok(Json(AddMoleculesResponse {
        ids,
        inserted_idx: meta.inserted_idx,
        existing_idx: meta.existing_idx,
        errors: meta.errors,
    }))
}

pub async fn get_molecule(
    State(app): State<SharedApp>,
    Path(id): Path<Id>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(gridserve_core::CoreError::from)?;
    let geometry = molecule::get(&mut conn, id).await?;
    Ok(Json(geometry))
}
