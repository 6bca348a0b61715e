//! C5 — the service iterator. Drives the "waves of child records" lifecycle
//! described in spec.md §4.5: a service record creates some children, waits
//! for all of them to reach a terminal status, then either creates the next
//! wave, fails fast, or completes.
//!
//! The chemistry-specific decision of *what the next wave looks like* is
//! factored into a pure, synchronous [`decide`]-shaped function per record
//! type (see [`gridopt`] and [`generic`]) so that the interesting logic is
//! unit-testable without a database. Everything else here — locking the
//! service row, loading dependency outcomes, interning molecules and
//! specifications, creating child records, persisting the checkpoint — is
//! shared plumbing.

pub mod generic;
pub mod gridopt;

use crate::error::{CoreError, CoreResult};
use crate::ids::IdSource;
use crate::record::{self, NewRecord, Outputs};
use gridserve_models::{Id, Priority, RecordStatus, RecordType};
use serde_json::Value;

/// One child a driver wants created in the next wave.
#[derive(Debug, Clone)]
pub struct ChildRequest {
    /// Identifies this child within the service's own bookkeeping (e.g. a
    /// serialized grid index). Stored on `service_dependencies.key` and
    /// handed back as `CompletedChild::key` once the child finishes.
    pub key: String,
    /// The molecule document to seed the child from. Re-interning an
    /// already-known document is a no-op (§4.2), so drivers pass content
    /// rather than plumbing ids through the pure decision function.
    pub molecule: Value,
    /// Keyword overrides merged into the service's base specification's
    /// keywords before interning the child's specification, if any.
    pub constraints: Option<Value>,
    pub child_type: RecordType,
}

/// A dependency the driver previously created, now in a terminal status.
#[derive(Debug, Clone)]
pub struct CompletedChild {
    pub key: String,
    pub status: RecordStatus,
    pub final_molecule_id: Option<Id>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Submit(Vec<ChildRequest>),
    FailFast(String),
    Done,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ServiceRow {
    record_id: Id,
    tag: String,
    priority: Priority,
    state: Value,
    stdout_id: Option<Id>,
}

/// Creates the `services` row for a freshly-created service record. Callers
/// (the submission API) do this inside the same transaction as
/// `record::create`.
pub async fn create_service(
    conn: &mut sqlx::PgConnection,
    record_id: Id,
    tag: &str,
    priority: Priority,
    initial_state: Value,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO services (record_id, tag, priority, state, stdout_id) VALUES ($1, $2, $3, $4, NULL)",
    )
    .bind(record_id)
    .bind(tag)
    .bind(priority)
    .bind(initial_state)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Finds up to `limit` services ready for another iteration: their record is
/// `waiting`/`running` and every dependency they currently hold has reached a
/// terminal status (or they have none yet, for a brand-new service). Locks
/// the chosen rows `FOR UPDATE SKIP LOCKED` so concurrent iterator workers
/// never double-drive the same service, mirroring the task queue's claim (C4).
pub async fn find_eligible(conn: &mut sqlx::PgConnection, limit: i64) -> CoreResult<Vec<Id>> {
    let ids: Vec<Id> = sqlx::query_scalar(
        r#"
        SELECT s.record_id
        FROM services s
        JOIN records r ON r.id = s.record_id
        WHERE r.status IN ('waiting', 'running')
          AND NOT EXISTS (
              SELECT 1 FROM service_dependencies sd
              JOIN records cr ON cr.id = sd.child_record_id
              WHERE sd.parent_record_id = s.record_id
                AND cr.status NOT IN ('complete', 'error', 'cancelled', 'invalid')
          )
        ORDER BY s.priority DESC, r.created_on ASC
        LIMIT $1
        FOR UPDATE OF s SKIP LOCKED
        "#,
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

async fn load_completed(
    conn: &mut sqlx::PgConnection,
    record_id: Id,
) -> CoreResult<Vec<CompletedChild>> {
    let rows: Vec<(String, RecordStatus, Option<Id>)> = sqlx::query_as(
        r#"
        SELECT sd.key, cr.status, cr.result_molecule_id
        FROM service_dependencies sd
        JOIN records cr ON cr.id = sd.child_record_id
        WHERE sd.parent_record_id = $1
        "#,
    )
    .bind(record_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(key, status, final_molecule_id)| CompletedChild {
            key,
            status,
            final_molecule_id,
        })
        .collect())
}

/// Runs one iteration of a single eligible service: evaluates fail-fast,
/// dispatches to the record-type-specific driver, and applies the resulting
/// [`Decision`]. Returns `true` if the service reached a terminal outcome
/// (completed or failed) this call.
pub async fn iterate_one(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    record_id: Id,
) -> CoreResult<bool> {
    let row: ServiceRow = sqlx::query_as("SELECT * FROM services WHERE record_id = $1")
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::not_found("service", record_id))?;

    let record = record::get(conn, record_id).await?;
    let completed = load_completed(conn, record_id).await?;

    if completed.iter().any(|c| c.status == RecordStatus::Error) {
        return fail(conn, ids, &row, "a dependency did not complete successfully").await;
    }

    let specification = load_specification(conn, record.specification_id).await?;

    let decision = match record.record_type {
        RecordType::Gridopt => {
            let molecules = fetch_dependency_molecules(conn, &completed).await?;
            let initial_molecule = initial_molecule(conn, record_id).await?;
            gridopt::decide(
                &row.state,
                &specification.keywords,
                &initial_molecule,
                &completed,
                &molecules,
            )?
        }
        _ => generic::decide(&row.state, &completed)?,
    };

    match decision.decision {
        Decision::Done => {
            tracing::info!(%record_id, "service completed");
            complete(conn, ids, &row).await.map(|_| true)
        }
        Decision::FailFast(reason) => {
            tracing::warn!(%record_id, %reason, "service failing fast");
            fail(conn, ids, &row, &reason).await
        }
        Decision::Submit(children) => {
            tracing::debug!(%record_id, wave_size = children.len(), "service submitting next wave");
            submit_wave(conn, ids, &row, &specification, children, decision.state).await?;
            Ok(false)
        }
    }
}

/// The driver's decision plus its updated checkpoint state, bundled so
/// plumbing code never has to guess whether a driver mutated state without
/// submitting anything (it always returns both together).
pub struct DriverOutcome {
    pub decision: Decision,
    pub state: Value,
}

async fn fetch_dependency_molecules(
    conn: &mut sqlx::PgConnection,
    completed: &[CompletedChild],
) -> CoreResult<std::collections::HashMap<Id, Value>> {
    let mut out = std::collections::HashMap::new();
    for child in completed {
        if let Some(molecule_id) = child.final_molecule_id {
            if out.contains_key(&molecule_id) {
                continue;
            }
            let doc: Value = sqlx::query_scalar("SELECT geometry FROM molecules WHERE id = $1")
                .bind(molecule_id)
                .fetch_one(&mut *conn)
                .await?;
            out.insert(molecule_id, doc);
        }
    }
    Ok(out)
}

async fn initial_molecule(conn: &mut sqlx::PgConnection, record_id: Id) -> CoreResult<Value> {
    let molecule_ids = record::get_molecule_ids(conn, record_id).await?;
    let molecule_id = molecule_ids
        .first()
        .ok_or_else(|| CoreError::developer_error("a service record must carry a seed molecule"))?;
    sqlx::query_scalar("SELECT geometry FROM molecules WHERE id = $1")
        .bind(molecule_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Into::into)
}

struct BaseSpecification {
    program: String,
    driver: Option<String>,
    keywords: Value,
    protocols: Value,
    base_specification_id: Option<Id>,
}

async fn load_specification(
    conn: &mut sqlx::PgConnection,
    specification_id: Id,
) -> CoreResult<BaseSpecification> {
    let row: (String, Option<String>, Value, Value, Option<Id>) = sqlx::query_as(
        "SELECT program, driver, keywords, protocols, base_specification_id FROM specifications WHERE id = $1",
    )
    .bind(specification_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(BaseSpecification {
        program: row.0,
        driver: row.1,
        keywords: row.2,
        protocols: row.3,
        base_specification_id: row.4,
    })
}

async fn submit_wave(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    row: &ServiceRow,
    specification: &BaseSpecification,
    children: Vec<ChildRequest>,
    next_state: Value,
) -> CoreResult<()> {
    // The optimization specification children of a gridopt service hang off
    // its `base_specification_id`, not off its own specification row (which
    // carries scan/preoptimization keywords that are meaningless to a plain
    // optimization record). Other drivers' children use the service's own
    // specification directly (§4.5 SUPPLEMENT).
    let child_base_spec = match specification.base_specification_id {
        Some(id) => load_specification(conn, id).await?,
        None => BaseSpecification {
            program: specification.program.clone(),
            driver: specification.driver.clone(),
            keywords: specification.keywords.clone(),
            protocols: specification.protocols.clone(),
            base_specification_id: None,
        },
    };

    let mut new_dependencies = Vec::with_capacity(children.len());

    for child in children {
        let mut keywords = child_base_spec.keywords.clone();
        if let Some(constraints) = &child.constraints {
            if let Value::Object(ref mut map) = keywords {
                map.insert("constraints".to_string(), constraints.clone());
            }
        }

        let spec_input = crate::spec::SpecificationInput {
            program: child_base_spec.program.clone(),
            method: None,
            basis: None,
            driver: child_base_spec.driver.clone(),
            keywords,
            protocols: child_base_spec.protocols.clone(),
            base_specification_id: child_base_spec.base_specification_id,
        };
        let (_outcome, child_spec_id) = crate::spec::intern_specification(conn, ids, spec_input).await?;

        let (_meta, molecule_ids) = crate::molecule::add_mixed(
            conn,
            ids,
            vec![crate::molecule::MoleculeInput::Literal(child.molecule)],
        )
        .await?;
        let molecule_id = molecule_ids
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| CoreError::developer_error("failed to intern a service child's seed molecule"))?;

        let child_record_id = record::create(
            conn,
            ids,
            NewRecord {
                record_type: child.child_type,
                specification_id: child_spec_id,
                molecule_ids: vec![molecule_id],
                owner_user: None,
                owner_group: None,
                tag: row.tag.clone(),
                priority: row.priority,
            },
        )
        .await?;

        crate::queue::enqueue(
            conn,
            crate::queue::EnqueueInput {
                record_id: child_record_id,
                function: serde_json::json!({"specification_id": child_spec_id, "molecule_id": molecule_id}),
                tag: row.tag.clone(),
                priority: row.priority,
                required_programs: vec![child_base_spec.program.clone()],
            },
        )
        .await?;

        new_dependencies.push((child.key, child_record_id));
    }

    sqlx::query("DELETE FROM service_dependencies WHERE parent_record_id = $1")
        .bind(row.record_id)
        .execute(&mut *conn)
        .await?;
    for (key, child_record_id) in &new_dependencies {
        sqlx::query(
            "INSERT INTO service_dependencies (parent_record_id, child_record_id, key) VALUES ($1, $2, $3)",
        )
        .bind(row.record_id)
        .bind(child_record_id)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("UPDATE services SET state = $2 WHERE record_id = $1")
        .bind(row.record_id)
        .bind(next_state)
        .execute(&mut *conn)
        .await?;

    let note = format!("submitted {} children for the next wave", new_dependencies.len());
    narrate(conn, ids, row, &note).await?;

    if record::get(conn, row.record_id).await?.status == RecordStatus::Waiting {
        record::transition(
            conn,
            row.record_id,
            RecordStatus::Running,
            Some("service-iterator"),
            serde_json::json!({"action": "iterate"}),
            Outputs::default(),
        )
        .await?;
    }

    Ok(())
}

async fn narrate(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    row: &ServiceRow,
    text: &str,
) -> CoreResult<()> {
    let stdout_id = crate::outputs::append_stdout(conn, ids, row.stdout_id, text).await?;
    sqlx::query("UPDATE services SET stdout_id = $2 WHERE record_id = $1")
        .bind(row.record_id)
        .bind(stdout_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn complete(conn: &mut sqlx::PgConnection, _ids: &IdSource, row: &ServiceRow) -> CoreResult<()> {
    record::transition(
        conn,
        row.record_id,
        RecordStatus::Complete,
        None,
        serde_json::json!({"action": "service_complete"}),
        Outputs {
            stdout: row.stdout_id,
            ..Outputs::default()
        },
    )
    .await?;
    sqlx::query("DELETE FROM services WHERE record_id = $1")
        .bind(row.record_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fail(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    row: &ServiceRow,
    reason: &str,
) -> CoreResult<bool> {
    let stdout_id = crate::outputs::append_stdout(conn, ids, row.stdout_id, reason).await?;
    let error_id = crate::outputs::insert_error_blob(conn, ids, &serde_json::json!({"reason": reason})).await?;
    record::transition(
        conn,
        row.record_id,
        RecordStatus::Error,
        None,
        serde_json::json!({"action": "service_error", "reason": reason}),
        Outputs {
            stdout: Some(stdout_id),
            error: Some(error_id),
            ..Outputs::default()
        },
    )
    .await?;
    sqlx::query("DELETE FROM services WHERE record_id = $1")
        .bind(row.record_id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_request_carries_a_type_for_dispatch() {
        let req = ChildRequest {
            key: "0-0".into(),
            molecule: Value::Null,
            constraints: None,
            child_type: RecordType::Optimization,
        };
        assert_eq!(req.child_type, RecordType::Optimization);
    }
}
