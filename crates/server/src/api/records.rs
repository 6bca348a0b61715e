use axum::extract::{Path, State};
use axum::Json;
use gridserve_core::molecule::{self, MoleculeInput};
use gridserve_core::record::{self, NewRecord, RecordFilter};
use gridserve_core::spec::{self, SpecificationInput};
use gridserve_core::{queue, service, CoreError};
use gridserve_models::{Id, Priority, RecordType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SharedApp;
use crate::api::error::ApiError;

/// One level of a specification chain, innermost entry first. Each entry's
/// `base_specification_id` is the id produced by interning the previous
/// entry, so a gridopt submission interns singlepoint, then optimization,
/// then its own gridopt specification, bottom-up (§4.1).
#[derive(Debug, Deserialize)]
pub struct SpecChainEntry {
    pub program: String,
    pub method: Option<String>,
    pub basis: Option<String>,
    pub driver: Option<String>,
    pub keywords: Value,
    #[serde(default)]
    pub protocols: Value,
}

#[derive(Debug, Deserialize)]
pub struct NewRecordRequest {
    pub record_type: RecordType,
    /// Interned bottom-up; the last entry is this record's own specification.
    pub specification_chain: Vec<SpecChainEntry>,
    /// The seed molecule (for `single`/`optimization`/`gridopt`).
    pub molecule: Value,
    /// Named seed geometries for the flat-wave record types
    /// (`torsion`/`neb`/`reaction`/`manybody`); required for those, ignored
    /// otherwise.
    #[serde(default)]
    pub points: Option<Vec<(String, Value)>>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
pub struct CreateRecordResponse {
    pub id: Id,
}

async fn intern_chain(
    conn: &mut sqlx::PgConnection,
    ids: &gridserve_core::IdSource,
    chain: Vec<SpecChainEntry>,
) -> Result<(Id, String), ApiError> {
    if chain.is_empty() {
        return Err(CoreError::developer_error("specification_chain must not be empty").into());
    }

    let mut base_specification_id = None;
    let mut last_id = None;
    let mut last_program = String::new();

    for entry in chain {
        let (_outcome, id) = spec::intern_specification(
            conn,
            ids,
            SpecificationInput {
                program: entry.program.clone(),
                method: entry.method,
                basis: entry.basis,
                driver: entry.driver,
                keywords: entry.keywords,
                protocols: entry.protocols,
                base_specification_id,
            },
        )
        .await?;
        base_specification_id = Some(id);
        last_id = Some(id);
        last_program = entry.program;
    }

    Ok((last_id.expect("chain is non-empty"), last_program))
}

pub async fn create_record(
    State(app): State<SharedApp>,
    Json(req): Json<NewRecordRequest>,
) -> Result<Json<CreateRecordResponse>, ApiError> {
    let mut tx = app.pool.begin().await.map_err(CoreError::from)?;

    let (specification_id, program) =
        intern_chain(&mut tx, &app.ids, req.specification_chain).await?;

    let (meta, molecule_ids) = molecule::add_mixed(
        &mut tx,
        &app.ids,
        vec![MoleculeInput::Literal(req.molecule)],
    )
    .await?;
    if !meta.success() {
        return Err(CoreError::developer_error("failed to intern the seed molecule").into());
    }
    let molecule_id = molecule_ids
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| CoreError::developer_error("failed to intern the seed molecule"))?;

    let tag = req.tag.unwrap_or_default();
    let priority = req.priority.unwrap_or_default();

    let record_id = record::create(
        &mut tx,
        &app.ids,
        NewRecord {
            record_type: req.record_type,
            specification_id,
            molecule_ids: vec![molecule_id],
            owner_user: None,
            owner_group: None,
            tag: tag.clone(),
            priority,
        },
    )
    .await?;

    if req.record_type.is_service() {
        let initial_state = match req.record_type {
            RecordType::Gridopt => Value::Null,
            _ => {
                let points = req.points.ok_or_else(|| {
                    CoreError::developer_error(format!(
                        "{:?} records must be submitted with `points`",
                        req.record_type
                    ))
                })?;
                serde_json::json!({"points": points, "submitted": false})
            }
        };
        service::create_service(&mut tx, record_id, &tag, priority, initial_state).await?;
    } else {
        queue::enqueue(
            &mut tx,
            queue::EnqueueInput {
                record_id,
                function: serde_json::json!({
                    "specification_id": specification_id,
                    "molecule_id": molecule_id,
                }),
                tag,
                priority,
                required_programs: vec![program],
            },
        )
        .await?;
    }

    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(CreateRecordResponse { id: record_id }))
}

pub async fn get_record(
    State(app): State<SharedApp>,
    Path(id): Path<Id>,
) -> Result<Json<record::Record>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    let found = record::get(&mut conn, id).await?;
    Ok(Json(found))
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub records: Vec<record::Record>,
    pub total: i64,
}

pub async fn query_records(
    State(app): State<SharedApp>,
    Json(filter): Json<RecordFilter>,
) -> Result<Json<QueryResponse>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    let (records, total) = record::query(&mut conn, filter).await?;
    Ok(Json(QueryResponse { records, total }))
}

pub async fn get_history(
    State(app): State<SharedApp>,
    Path(id): Path<Id>,
) -> Result<Json<Vec<record::HistoryEntry>>, ApiError> {
    let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
    let entries = record::history(&mut conn, id).await?;
    Ok(Json(entries))
}

macro_rules! transition_handler {
    ($name:ident, $op:path) => {
        pub async fn $name(
            State(app): State<SharedApp>,
            Path(id): Path<Id>,
        ) -> Result<Json<()>, ApiError> {
            let mut conn = app.pool.acquire().await.map_err(CoreError::from)?;
            $op(&mut conn, id).await?;
            Ok(Json(()))
        }
    };
}

transition_handler!(cancel_record, record::cancel);
transition_handler!(uncancel_record, record::uncancel);
transition_handler!(invalidate_record, record::invalidate);
transition_handler!(soft_delete_record, record::soft_delete);
transition_handler!(undelete_record, record::undelete);

/// `reset`: re-enqueues a task record from its original specification and
/// seed molecule, reconstructing the function payload `create_record` would
/// have submitted. Service records cannot be reset this way (`queue::reset`
/// rejects them) — a service's own iterator drives its retries.
pub async fn reset_record(
    State(app): State<SharedApp>,
    Path(id): Path<Id>,
) -> Result<Json<()>, ApiError> {
    let mut tx = app.pool.begin().await.map_err(CoreError::from)?;

    let found = record::get(&mut tx, id).await?;
    let molecule_ids = record::get_molecule_ids(&mut tx, id).await?;
    let molecule_id = molecule_ids
        .first()
        .copied()
        .ok_or_else(|| CoreError::developer_error("record has no seed molecule to reset with"))?;

    let function = serde_json::json!({
        "specification_id": found.specification_id,
        "molecule_id": molecule_id,
    });
    queue::reset(&mut tx, id, function).await?;

    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(()))
}

pub async fn hard_delete_record(
    State(app): State<SharedApp>,
    Path(id): Path<Id>,
) -> Result<Json<()>, ApiError> {
    let mut tx = app.pool.begin().await.map_err(CoreError::from)?;
    record::hard_delete(&mut tx, id).await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(()))
}
