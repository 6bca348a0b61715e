//! C7 — the output store. Write-once stdout/stderr/error blobs referenced
//! by id; see spec.md §4.7.

use crate::error::CoreResult;
use crate::ids::IdSource;
use crate::record::Outputs;
use flate2::write::GzEncoder;
use flate2::Compression;
use gridserve_models::{Id, OutputType};
use serde_json::Value;
use std::io::Write;

/// Compresses `bytes` with gzip, matching the compression the teacher's
/// dependency set (`flate2`/`async-compression`) uses for comparable blob
/// storage.
fn compress(bytes: &[u8]) -> CoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|err| crate::error::CoreError::developer_error(format!("failed to compress output: {err}")))?;
    encoder
        .finish()
        .map_err(|err| crate::error::CoreError::developer_error(format!("failed to finish compression: {err}")))
}

async fn insert_blob(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    output_type: OutputType,
    raw: &[u8],
) -> CoreResult<Id> {
    let id = ids.next();
    let compressed = compress(raw)?;

    sqlx::query(
        "INSERT INTO output_blobs (id, output_type, payload, uncompressed_size) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(output_type)
    .bind(&compressed)
    .bind(raw.len() as i64)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// Persists a manager's returned stdout/stderr/error payloads, producing
/// the `Outputs` map to attach to the corresponding compute-history entry.
pub async fn persist_task_outputs(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    error: Option<Value>,
) -> CoreResult<Outputs> {
    let stdout = match stdout {
        Some(bytes) if !bytes.is_empty() => {
            Some(insert_blob(conn, ids, OutputType::Stdout, &bytes).await?)
        }
        _ => None,
    };
    let stderr = match stderr {
        Some(bytes) if !bytes.is_empty() => {
            Some(insert_blob(conn, ids, OutputType::Stderr, &bytes).await?)
        }
        _ => None,
    };
    let error = match error {
        Some(value) => {
            let bytes = serde_json::to_vec(&value).map_err(|err| {
                crate::error::CoreError::developer_error(format!("failed to encode error payload: {err}"))
            })?;
            Some(insert_blob(conn, ids, OutputType::Error, &bytes).await?)
        }
        None => None,
    };

    Ok(Outputs { stdout, stderr, error })
}

/// Persists a standalone error blob (outside of a manager's task return,
/// e.g. a service's fail-fast reason) and returns its id.
pub async fn insert_error_blob(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    value: &Value,
) -> CoreResult<Id> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        crate::error::CoreError::developer_error(format!("failed to encode error payload: {err}"))
    })?;
    insert_blob(conn, ids, OutputType::Error, &bytes).await
}

/// Appends text to an existing stdout blob, or creates one if absent —
/// used by the service iterator to narrate each wave (§4.5).
pub async fn append_stdout(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    existing: Option<Id>,
    text: &str,
) -> CoreResult<Id> {
    let mut combined = match existing {
        Some(id) => decompress_blob(conn, id).await?,
        None => Vec::new(),
    };
    if !combined.is_empty() {
        combined.push(b'\n');
    }
    combined.extend_from_slice(text.as_bytes());

    if let Some(old_id) = existing {
        delete_blobs(conn, &[old_id]).await?;
    }

    insert_blob(conn, ids, OutputType::Stdout, &combined).await
}

async fn decompress_blob(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let payload: Vec<u8> = sqlx::query_scalar("SELECT payload FROM output_blobs WHERE id = $1")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    let mut decoder = GzDecoder::new(payload.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|err| {
        crate::error::CoreError::developer_error(format!("failed to decompress output blob {id}: {err}"))
    })?;
    Ok(out)
}

/// Blobs are write-once and referenced by id; replacing a record's output
/// deletes the old blobs in the same transaction as the reference update.
pub async fn delete_blobs(conn: &mut sqlx::PgConnection, ids: &[Id]) -> CoreResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM output_blobs WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
