//! C6 — the manager registry. Tracks managers, heartbeats, tag filters,
//! and reclaims in-flight work when a manager goes missing; see spec.md
//! §4.6.

use crate::error::{CoreError, CoreResult};
use crate::record::{self, Outputs};
use chrono::{DateTime, Utc};
use gridserve_models::RecordStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
pub enum ManagerStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Manager {
    pub name: String,
    pub cluster: Option<String>,
    pub hostname: Option<String>,
    pub tags: Vec<String>,
    pub programs: Vec<String>,
    pub status: String,
    pub claimed: i64,
    pub returned: i64,
    pub last_heartbeat: DateTime<Utc>,
}

pub struct Activation {
    pub name: String,
    pub cluster: Option<String>,
    pub hostname: Option<String>,
    pub tags: Vec<String>,
    pub programs: Vec<String>,
}

pub async fn activate(conn: &mut sqlx::PgConnection, activation: Activation) -> CoreResult<Manager> {
    sqlx::query(
        r#"
        INSERT INTO managers (name, cluster, hostname, tags, programs, status, claimed, returned, last_heartbeat)
        VALUES ($1, $2, $3, $4, $5, 'active', 0, 0, now())
        ON CONFLICT (name) DO UPDATE SET
            cluster = EXCLUDED.cluster,
            hostname = EXCLUDED.hostname,
            tags = EXCLUDED.tags,
            programs = EXCLUDED.programs,
            status = 'active',
            last_heartbeat = now()
        "#,
    )
    .bind(&activation.name)
    .bind(&activation.cluster)
    .bind(&activation.hostname)
    .bind(&activation.tags)
    .bind(&activation.programs)
    .execute(&mut *conn)
    .await?;

    get(conn, &activation.name).await
}

pub async fn get(conn: &mut sqlx::PgConnection, name: &str) -> CoreResult<Manager> {
    sqlx::query_as("SELECT * FROM managers WHERE name = $1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::not_found("manager", name))
}

pub async fn heartbeat(conn: &mut sqlx::PgConnection, name: &str) -> CoreResult<()> {
    let updated = sqlx::query(
        "UPDATE managers SET last_heartbeat = now() WHERE name = $1 AND status = 'active'",
    )
    .bind(name)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::not_found("active manager", name));
    }
    Ok(())
}

/// `deactivate`: the graceful variant of going inactive. Reclaims the
/// manager's in-flight records exactly as the heartbeat sweep would.
pub async fn deactivate(conn: &mut sqlx::PgConnection, name: &str) -> CoreResult<()> {
    sqlx::query("UPDATE managers SET status = 'inactive' WHERE name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    reclaim(conn, name).await
}

/// Returns a manager's in-flight `running` records to `waiting`, re-creating
/// their task rows so they are claimable by any manager.
async fn reclaim(conn: &mut sqlx::PgConnection, manager_name: &str) -> CoreResult<usize> {
    let orphaned: Vec<(gridserve_models::Id, serde_json::Value)> = sqlx::query_as(
        r#"
        SELECT r.id, COALESCE(
            (SELECT function FROM tasks WHERE record_id = r.id),
            '{}'::jsonb
        )
        FROM records r
        WHERE r.status = 'running' AND r.manager_name = $1
        "#,
    )
    .bind(manager_name)
    .fetch_all(&mut *conn)
    .await?;

    for (record_id, function) in &orphaned {
        record::transition(
            conn,
            *record_id,
            RecordStatus::Waiting,
            None,
            serde_json::json!({"action": "reclaimed", "manager": manager_name}),
            Outputs::default(),
        )
        .await?;

        let record = record::get(conn, *record_id).await?;
        crate::queue::enqueue(
            conn,
            crate::queue::EnqueueInput {
                record_id: *record_id,
                function: function.clone(),
                tag: record.tag,
                priority: record.priority,
                required_programs: Vec::new(),
            },
        )
        .await?;
    }

    Ok(orphaned.len())
}

/// Sweeps all managers whose heartbeat has exceeded
/// `heartbeat_max_missed * heartbeat_period`, transitioning them to
/// `inactive` and reclaiming their in-flight work. Returns the names of
/// managers newly marked inactive.
pub async fn sweep_inactive(
    conn: &mut sqlx::PgConnection,
    heartbeat_period: std::time::Duration,
    heartbeat_max_missed: u32,
) -> CoreResult<Vec<String>> {
    let threshold = heartbeat_period * heartbeat_max_missed;
    let threshold_secs = threshold.as_secs_f64();

    let missing: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT name FROM managers
        WHERE status = 'active' AND last_heartbeat < now() - ($1 || ' seconds')::interval
        "#,
    )
    .bind(threshold_secs.to_string())
    .fetch_all(&mut *conn)
    .await?;

    for name in &missing {
        sqlx::query("UPDATE managers SET status = 'inactive' WHERE name = $1")
            .bind(name)
            .execute(&mut *conn)
            .await?;
        reclaim(conn, name).await?;
    }

    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_scales_with_missed_beats() {
        let period = std::time::Duration::from_secs(10);
        let missed = 3u32;
        assert_eq!((period * missed).as_secs(), 30);
    }
}
