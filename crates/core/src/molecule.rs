//! C2 — the molecule store. Canonicalizes molecules by content hash and
//! interns them; see spec.md §4.2.

use crate::canonical::content_hash;
use crate::error::{CoreError, CoreResult};
use crate::ids::IdSource;
use gridserve_models::Id;
use serde_json::Value;
use std::collections::HashMap;

/// Either a literal molecule document to be hashed and interned, or a
/// reference to a molecule that is expected to already exist.
#[derive(Debug, Clone)]
pub enum MoleculeInput {
    Literal(Value),
    Existing(Id),
}

#[derive(Debug, Default)]
pub struct MoleculeInsertMetadata {
    pub inserted_idx: Vec<usize>,
    pub existing_idx: Vec<usize>,
    /// (index, message) for `Existing` references to ids that do not exist.
    pub errors: Vec<(usize, String)>,
}

impl MoleculeInsertMetadata {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interns a mix of literal molecules and existing-id references, returning
/// ids in the same order as `inputs`. Literals that hash identically within
/// one call coalesce to a single insert (§4.2); an unknown existing id
/// produces a per-index error rather than failing the whole call.
pub async fn add_mixed(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    inputs: Vec<MoleculeInput>,
) -> CoreResult<(MoleculeInsertMetadata, Vec<Option<Id>>)> {
    let mut meta = MoleculeInsertMetadata::default();
    let mut out: Vec<Option<Id>> = Vec::with_capacity(inputs.len());
    // Coalesces identical literal hashes within this single call to one insert.
    let mut seen_this_call: HashMap<String, Id> = HashMap::new();

    for (idx, input) in inputs.into_iter().enumerate() {
        match input {
            MoleculeInput::Existing(id) => {
                let exists: Option<Id> =
                    sqlx::query_scalar("SELECT id FROM molecules WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await?;
                match exists {
                    Some(id) => {
                        meta.existing_idx.push(idx);
                        out.push(Some(id));
                    }
                    None => {
                        meta.errors.push((idx, format!("unknown molecule id {id}")));
                        out.push(None);
                    }
                }
            }
            MoleculeInput::Literal(doc) => {
                let hash = content_hash(doc.clone())?;

                if let Some(&id) = seen_this_call.get(&hash) {
                    meta.existing_idx.push(idx);
                    out.push(Some(id));
                    continue;
                }

                let new_id = ids.next();
                let inserted: Option<Id> = sqlx::query_scalar(
                    r#"
                    INSERT INTO molecules (id, content_hash, geometry)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (content_hash) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(new_id)
                .bind(&hash)
                .bind(&doc)
                .fetch_optional(&mut *conn)
                .await?;

                let id = match inserted {
                    Some(id) => {
                        meta.inserted_idx.push(idx);
                        id
                    }
                    None => {
                        let existing: Id =
                            sqlx::query_scalar("SELECT id FROM molecules WHERE content_hash = $1")
                                .bind(&hash)
                                .fetch_one(&mut *conn)
                                .await?;
                        meta.existing_idx.push(idx);
                        existing
                    }
                };

                seen_this_call.insert(hash, id);
                out.push(Some(id));
            }
        }
    }

    Ok((meta, out))
}

/// Fetches a single molecule's geometry document by id.
pub async fn get(conn: &mut sqlx::PgConnection, id: Id) -> CoreResult<Value> {
    sqlx::query_scalar("SELECT geometry FROM molecules WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::not_found("molecule", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_literals_hash_identically() {
        let a = json!({"symbols": ["O", "H", "H"], "geometry": [0.0, 0.0, 0.0]});
        let b = json!({"geometry": [0.0, 0.0, 0.0], "symbols": ["O", "H", "H"]});
        assert_eq!(content_hash(a).unwrap(), content_hash(b).unwrap());
    }
}
