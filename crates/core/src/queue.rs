//! C4 — the task queue. Append, claim, return, and reset task rows; see
//! spec.md §4.4. The `claim` dequeue query is grounded directly in the
//! teacher's `automations::server::ready_tasks_iter`: a single `WITH
//! picked AS (... FOR UPDATE SKIP LOCKED) UPDATE ... RETURNING` statement,
//! run once per tag in the manager's declared preference order.

use crate::error::{CoreError, CoreResult};
use crate::record::{self, Outputs};
use chrono::{DateTime, Utc};
use gridserve_models::{Id, Priority, RecordStatus, ANY_TAG};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct EnqueueInput {
    pub record_id: Id,
    pub function: Value,
    pub tag: String,
    pub priority: Priority,
    pub required_programs: Vec<String>,
}

/// Idempotent append: if a task row for `record_id` already exists, only
/// its `available_date` is refreshed.
pub async fn enqueue(conn: &mut sqlx::PgConnection, input: EnqueueInput) -> CoreResult<()> {
    let tag = if input.tag.is_empty() { ANY_TAG.to_string() } else { input.tag };

    sqlx::query(
        r#"
        INSERT INTO tasks (record_id, function, tag, priority, required_programs, created_on, available_date)
        VALUES ($1, $2, $3, $4, $5, now(), now())
        ON CONFLICT (record_id) DO UPDATE SET available_date = now()
        "#,
    )
    .bind(input.record_id)
    .bind(&input.function)
    .bind(&tag)
    .bind(input.priority)
    .bind(&input.required_programs)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedTask {
    pub record_id: Id,
    pub function: Value,
    pub tag: String,
    pub priority: Priority,
    pub required_programs: Vec<String>,
    pub created_on: DateTime<Utc>,
}

/// Claims up to `limit` ready tasks for `manager_name`, iterating its
/// `tags_wanted` in declared order and filling the remaining budget from
/// each tag before moving to the next (§4.4: "across tags the order is
/// that of the manager's preference list — manager-chosen, not global").
/// `FOR UPDATE SKIP LOCKED` makes concurrent claims return disjoint rows
/// without any application-level lock.
pub async fn claim(
    conn: &mut sqlx::PgConnection,
    manager_name: &str,
    tags_wanted: &[String],
    programs_advertised: &[String],
    limit: i64,
) -> CoreResult<Vec<ClaimedTask>> {
    let mut claimed = Vec::new();
    let mut remaining = limit;

    for tag in tags_wanted {
        if remaining <= 0 {
            break;
        }

        let rows: Vec<ClaimedTask> = sqlx::query_as(
            r#"
            SELECT t.record_id, t.function, t.tag, t.priority, t.required_programs, t.created_on
            FROM tasks t
            JOIN records r ON r.id = t.record_id
            WHERE
                (t.tag = $1 OR $1 = '*' OR t.tag = '*')
                AND t.required_programs <@ $2::text[]
                AND r.status = 'waiting'
            ORDER BY t.priority DESC, t.created_on ASC
            LIMIT $3
            FOR UPDATE OF t SKIP LOCKED
            "#,
        )
        .bind(tag)
        .bind(programs_advertised)
        .bind(remaining)
        .fetch_all(&mut *conn)
        .await?;

        for row in &rows {
            record::transition(
                conn,
                row.record_id,
                RecordStatus::Running,
                Some(manager_name),
                serde_json::json!({"action": "claim", "manager": manager_name}),
                Outputs::default(),
            )
            .await?;
        }

        remaining -= rows.len() as i64;
        claimed.extend(rows);
    }

    // The task row is left in place (not deleted here) so a manager that
    // misses its heartbeat can be reclaimed with its original function
    // payload intact — see `manager::reclaim`. It is cleaned up once the
    // record reaches a terminal status in `return_results`, and the claim
    // query above only ever matches tasks whose record is still `waiting`.
    if !claimed.is_empty() {
        sqlx::query("UPDATE managers SET claimed = claimed + $2 WHERE name = $1")
            .bind(manager_name)
            .bind(claimed.len() as i64)
            .execute(&mut *conn)
            .await?;
    }

    Ok(claimed)
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub record_id: Id,
    pub success: bool,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub error: Option<Value>,
    /// For `optimization` records: the final geometry the manager produced,
    /// interned as a molecule and recorded on the record so a dependent
    /// service's next wave can seed its children from it (§4.5).
    pub final_molecule: Option<Value>,
}

/// Processes one manager's batch of returns in the order supplied, within
/// the caller's transaction. A record that is no longer `running` under
/// this manager (cancelled, deleted, reassigned) is silently skipped: its
/// result is discarded and a history note records the late return (§5
/// cancellation semantics, §8 scenario 5).
pub async fn return_results(
    conn: &mut sqlx::PgConnection,
    ids: &crate::ids::IdSource,
    manager_name: &str,
    results: Vec<TaskResult>,
) -> CoreResult<()> {
    let mut returned = 0i64;

    for result in results {
        let record = record::get(conn, result.record_id).await?;

        if record.status != RecordStatus::Running || record.manager_name.as_deref() != Some(manager_name) {
            tracing::warn!(
                record_id = %result.record_id,
                %manager_name,
                status = %record.status,
                "ignoring a late or misdirected task return"
            );
            record::append_history(
                conn,
                result.record_id,
                record.status,
                Some(manager_name),
                serde_json::json!({"action": "late_return_ignored", "manager": manager_name}),
                Outputs::default(),
            )
            .await?;
            continue;
        }

        let outputs = crate::outputs::persist_task_outputs(
            conn,
            ids,
            result.stdout,
            result.stderr,
            result.error.clone(),
        )
        .await?;

        if result.success {
            if let Some(molecule) = result.final_molecule.clone() {
                let (_meta, interned) = crate::molecule::add_mixed(
                    conn,
                    ids,
                    vec![crate::molecule::MoleculeInput::Literal(molecule)],
                )
                .await?;
                if let Some(Some(molecule_id)) = interned.into_iter().next() {
                    record::set_result_molecule(conn, result.record_id, molecule_id).await?;
                }
            }
        }

        let to = if result.success {
            RecordStatus::Complete
        } else {
            RecordStatus::Error
        };

        let provenance = match &result.error {
            Some(err) => serde_json::json!({"action": "return", "manager": manager_name, "error": err}),
            None => serde_json::json!({"action": "return", "manager": manager_name}),
        };

        record::transition(conn, result.record_id, to, Some(manager_name), provenance, outputs).await?;

        sqlx::query("DELETE FROM tasks WHERE record_id = $1")
            .bind(result.record_id)
            .execute(&mut *conn)
            .await?;
        returned += 1;
    }

    if returned > 0 {
        sqlx::query("UPDATE managers SET returned = returned + $2 WHERE name = $1")
            .bind(manager_name)
            .bind(returned)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// `reset`: forces `error | cancelled | running-orphaned -> waiting` and
/// re-creates the task row from the record's last-known function payload.
pub async fn reset(
    conn: &mut sqlx::PgConnection,
    record_id: Id,
    function: Value,
) -> CoreResult<()> {
    let record = record::get(conn, record_id).await?;
    if record.is_service {
        return Err(CoreError::developer_error(
            "reset on a service record must go through the service iterator, not the task queue",
        ));
    }

    record::reset(conn, record_id).await?;

    enqueue(
        conn,
        EnqueueInput {
            record_id,
            function,
            tag: record.tag,
            priority: record.priority,
            required_programs: Vec::new(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_defaults_empty_tag_to_wildcard() {
        let input = EnqueueInput {
            record_id: Id::from_hex("0000000000000001").unwrap(),
            function: Value::Null,
            tag: String::new(),
            priority: Priority::Normal,
            required_programs: Vec::new(),
        };
        let tag = if input.tag.is_empty() { ANY_TAG.to_string() } else { input.tag };
        assert_eq!(tag, "*");
    }
}
