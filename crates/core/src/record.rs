//! C3 — the record store. CRUD over records, status transitions enforced
//! by the table in spec.md §4.3, and the compute-history log.

use crate::error::{CoreError, CoreResult};
use crate::ids::IdSource;
use chrono::{DateTime, Utc};
use gridserve_models::{Id, Priority, RecordStatus, RecordType, ANY_TAG};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Outputs {
    pub stdout: Option<Id>,
    pub stderr: Option<Id>,
    pub error: Option<Id>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub record_id: Id,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub modified_on: DateTime<Utc>,
    pub provenance: Value,
    pub stdout_id: Option<Id>,
    pub stderr_id: Option<Id>,
    pub error_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Record {
    pub id: Id,
    pub record_type: RecordType,
    pub specification_id: Id,
    pub status: RecordStatus,
    pub is_service: bool,
    pub manager_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
    pub tag: String,
    pub priority: Priority,
    /// Status recorded immediately prior to a soft delete, so `undelete`
    /// knows where to restore to.
    pub prior_status: Option<RecordStatus>,
    /// The final-geometry molecule a completed `optimization` record
    /// produced, consumed by service drivers (gridopt, torsion, ...) when
    /// seeding the next wave's children.
    pub result_molecule_id: Option<Id>,
}

pub async fn set_result_molecule(
    conn: &mut sqlx::PgConnection,
    record_id: Id,
    molecule_id: Id,
) -> CoreResult<()> {
    sqlx::query("UPDATE records SET result_molecule_id = $2 WHERE id = $1")
        .bind(record_id)
        .bind(molecule_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Checks whether `from -> to` is a legal transition per the table in
/// spec.md §4.3. This is the single authoritative implementation of that
/// table; every status-mutating operation in C3-C6 routes through it.
pub fn check_transition(id: Id, from: RecordStatus, to: RecordStatus) -> CoreResult<()> {
    use RecordStatus::*;

    let ok = matches!(
        (from, to),
        (Waiting, Running)
            | (Waiting, Error)
            | (Waiting, Cancelled)
            | (Waiting, Invalid)
            | (Waiting, Deleted)
            | (Running, Waiting)
            | (Running, Complete)
            | (Running, Error)
            | (Running, Cancelled)
            | (Complete, Invalid)
            | (Complete, Deleted)
            | (Error, Waiting)
            | (Error, Cancelled)
            | (Error, Deleted)
            | (Cancelled, Waiting)
            | (Cancelled, Deleted)
            | (Invalid, Waiting)
            | (Invalid, Deleted)
    );

    if ok {
        Ok(())
    } else {
        Err(CoreError::invalid_transition(id, from, to))
    }
}

#[derive(Debug, Clone)]
pub struct NewRecord {
    pub record_type: RecordType,
    pub specification_id: Id,
    pub molecule_ids: Vec<Id>,
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
    pub tag: String,
    pub priority: Priority,
}

/// Creates a record in `waiting` status and writes its first compute-history
/// entry. Does not enqueue a task or service row; callers (C4/C5 creation
/// paths) do that as a second step inside the same transaction.
pub async fn create(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    new: NewRecord,
) -> CoreResult<Id> {
    let id = ids.next();
    let tag = if new.tag.is_empty() {
        ANY_TAG.to_string()
    } else {
        new.tag
    };
    let is_service = new.record_type.is_service();

    sqlx::query(
        r#"
        INSERT INTO records
            (id, record_type, specification_id, status, is_service, owner_user, owner_group, tag, priority)
        VALUES ($1, $2, $3, 'waiting', $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(new.record_type)
    .bind(new.specification_id)
    .bind(is_service)
    .bind(&new.owner_user)
    .bind(&new.owner_group)
    .bind(&tag)
    .bind(new.priority)
    .execute(&mut *conn)
    .await?;

    for (position, molecule_id) in new.molecule_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO record_molecules (record_id, molecule_id, position) VALUES ($1, $2, $3)",
        )
        .bind(id)
        .bind(molecule_id)
        .bind(position as i32)
        .execute(&mut *conn)
        .await?;
    }

    append_history(conn, id, RecordStatus::Waiting, None, Value::Null, Outputs::default()).await?;

    Ok(id)
}

pub async fn get(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<Record> {
    sqlx::query_as("SELECT * FROM records WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::not_found("record", id))
}

pub async fn get_molecule_ids(conn: &mut sqlx::PgConnection, record_id: Id) -> CoreResult<Vec<Id>> {
    let ids: Vec<Id> = sqlx::query_scalar(
        "SELECT molecule_id FROM record_molecules WHERE record_id = $1 ORDER BY position",
    )
    .bind(record_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub record_type: Option<RecordType>,
    pub status: Option<RecordStatus>,
    pub tag: Option<String>,
    pub owner_user: Option<String>,
    #[serde(default = "default_query_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_query_limit() -> i64 {
    100
}

/// Paginated query returning `(records, total_count)`, the same
/// metadata-plus-rows shape the wire protocol's `/v1/records/query` returns.
pub async fn query(
    conn: &mut sqlx::PgConnection,
    filter: RecordFilter,
) -> CoreResult<(Vec<Record>, i64)> {
    let records: Vec<Record> = sqlx::query_as(
        r#"
        SELECT * FROM records
        WHERE ($1::record_type IS NULL OR record_type = $1)
          AND ($2::record_status IS NULL OR status = $2)
          AND ($3::text IS NULL OR tag = $3)
          AND ($4::text IS NULL OR owner_user = $4)
        ORDER BY created_on ASC
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(filter.record_type)
    .bind(filter.status)
    .bind(&filter.tag)
    .bind(&filter.owner_user)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(&mut *conn)
    .await?;

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT count(*) FROM records
        WHERE ($1::record_type IS NULL OR record_type = $1)
          AND ($2::record_status IS NULL OR status = $2)
          AND ($3::text IS NULL OR tag = $3)
          AND ($4::text IS NULL OR owner_user = $4)
        "#,
    )
    .bind(filter.record_type)
    .bind(filter.status)
    .bind(&filter.tag)
    .bind(&filter.owner_user)
    .fetch_one(&mut *conn)
    .await?;

    Ok((records, total))
}

/// Appends one compute-history entry. Every state-changing operation calls
/// this alongside its status update.
pub async fn append_history(
    conn: &mut sqlx::PgConnection,
    record_id: Id,
    status: RecordStatus,
    manager_name: Option<&str>,
    provenance: Value,
    outputs: Outputs,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO compute_history
            (record_id, status, manager_name, modified_on, provenance, stdout_id, stderr_id, error_id)
        VALUES ($1, $2, $3, now(), $4, $5, $6, $7)
        "#,
    )
    .bind(record_id)
    .bind(status)
    .bind(manager_name)
    .bind(provenance)
    .bind(outputs.stdout)
    .bind(outputs.stderr)
    .bind(outputs.error)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn history(conn: &mut sqlx::PgConnection, record_id: Id) -> CoreResult<Vec<HistoryEntry>> {
    let entries = sqlx::query_as(
        "SELECT * FROM compute_history WHERE record_id = $1 ORDER BY modified_on ASC",
    )
    .bind(record_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(entries)
}

/// Performs a checked status transition and logs it, enforcing invariant 2
/// (`running` implies `manager_name` is set).
pub async fn transition(
    conn: &mut sqlx::PgConnection,
    id: Id,
    to: RecordStatus,
    manager_name: Option<&str>,
    provenance: Value,
    outputs: Outputs,
) -> CoreResult<()> {
    let record = get(conn, id).await?;
    check_transition(id, record.status, to)?;

    if to == RecordStatus::Running && manager_name.is_none() {
        return Err(CoreError::developer_error(
            "a record transitioning to running must carry a manager_name",
        ));
    }

    if to == RecordStatus::Deleted {
        sqlx::query("UPDATE records SET status = $2, prior_status = $3, manager_name = NULL, modified_on = now() WHERE id = $1")
            .bind(id)
            .bind(to)
            .bind(record.status)
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query(
            "UPDATE records SET status = $2, manager_name = $3, modified_on = now() WHERE id = $1",
        )
        .bind(id)
        .bind(to)
        .bind(manager_name)
        .execute(&mut *conn)
        .await?;
    }

    append_history(conn, id, to, manager_name, provenance, outputs).await
}

/// `reset`: forces `error | cancelled | running-orphaned -> waiting`. Does
/// not re-create the task row; that is the task queue's (C4) job.
pub async fn reset(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    transition(
        conn,
        id,
        RecordStatus::Waiting,
        None,
        serde_json::json!({"action": "reset"}),
        Outputs::default(),
    )
    .await
}

pub async fn cancel(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    transition(
        conn,
        id,
        RecordStatus::Cancelled,
        None,
        serde_json::json!({"action": "cancel"}),
        Outputs::default(),
    )
    .await
}

pub async fn invalidate(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    transition(
        conn,
        id,
        RecordStatus::Invalid,
        None,
        serde_json::json!({"action": "invalidate"}),
        Outputs::default(),
    )
    .await
}

pub async fn uncancel(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    transition(
        conn,
        id,
        RecordStatus::Waiting,
        None,
        serde_json::json!({"action": "uncancel"}),
        Outputs::default(),
    )
    .await
}

/// Soft delete: the record remains but refuses further transitions except
/// `undelete`.
pub async fn soft_delete(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    transition(
        conn,
        id,
        RecordStatus::Deleted,
        None,
        serde_json::json!({"action": "delete"}),
        Outputs::default(),
    )
    .await
}

/// `undelete`: restores a soft-deleted record to the status recorded at
/// delete time.
pub async fn undelete(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    let record = get(conn, id).await?;
    if record.status != RecordStatus::Deleted {
        return Err(CoreError::invalid_transition(
            id,
            record.status,
            RecordStatus::Waiting,
        ));
    }
    let prior = record.prior_status.unwrap_or(RecordStatus::Waiting);

    sqlx::query("UPDATE records SET status = $2, prior_status = NULL, modified_on = now() WHERE id = $1")
        .bind(id)
        .bind(prior)
        .execute(&mut *conn)
        .await?;

    append_history(
        conn,
        id,
        prior,
        None,
        serde_json::json!({"action": "undelete"}),
        Outputs::default(),
    )
    .await
}

/// Hard delete: removes the record and cascades to its task/service rows,
/// history, and (for services) dependency links — but never to child
/// records, which may be shared (§8 scenario 6).
pub async fn hard_delete(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<()> {
    let record = get(conn, id).await?;
    if record.status != RecordStatus::Deleted {
        return Err(CoreError::invalid_transition(
            id,
            record.status,
            RecordStatus::Deleted,
        ));
    }

    sqlx::query("DELETE FROM service_dependencies WHERE parent_record_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM services WHERE record_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM tasks WHERE record_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM compute_history WHERE record_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM record_molecules WHERE record_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM records WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridserve_models::Id;

    fn id() -> Id {
        Id::from_hex("0000000000000001").unwrap()
    }

    #[test]
    fn transition_table_matches_spec() {
        use RecordStatus::*;

        let allowed = [
            (Waiting, Running),
            (Waiting, Error),
            (Waiting, Cancelled),
            (Waiting, Invalid),
            (Waiting, Deleted),
            (Running, Waiting),
            (Running, Complete),
            (Running, Error),
            (Running, Cancelled),
            (Complete, Invalid),
            (Complete, Deleted),
            (Error, Waiting),
            (Error, Cancelled),
            (Error, Deleted),
            (Cancelled, Waiting),
            (Cancelled, Deleted),
            (Invalid, Waiting),
            (Invalid, Deleted),
        ];
        for (from, to) in allowed {
            assert!(check_transition(id(), from, to).is_ok(), "{from} -> {to} should be allowed");
        }
    }

    #[test]
    fn forbidden_transitions_are_rejected() {
        use RecordStatus::*;
        let forbidden = [
            (Waiting, Complete),
            (Complete, Running),
            (Complete, Waiting),
            (Complete, Error),
            (Deleted, Running),
            (Deleted, Waiting),
            (Cancelled, Running),
            (Invalid, Complete),
        ];
        for (from, to) in forbidden {
            assert!(check_transition(id(), from, to).is_err(), "{from} -> {to} should be rejected");
        }
    }

    #[test]
    fn no_status_transitions_to_itself() {
        use RecordStatus::*;
        for s in [Waiting, Running, Complete, Error, Cancelled, Invalid, Deleted] {
            assert!(check_transition(id(), s, s).is_err());
        }
    }
}
