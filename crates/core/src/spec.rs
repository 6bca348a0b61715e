//! C1 — the specification deduper. Canonicalizes and interns
//! content-addressed specifications; see spec.md §4.1.

use crate::canonical::content_hash;
use crate::error::CoreResult;
use crate::ids::IdSource;
use gridserve_models::Id;
use serde_json::{json, Value};

/// A specification prior to interning. `base_specification_id` links a
/// procedure-specific specification (e.g. optimization) to the
/// specification it wraps (e.g. singlepoint), allowing nested specs to be
/// interned bottom-up: the caller interns the innermost specification
/// first, then threads its id into the next level's `base_specification_id`.
#[derive(Debug, Clone)]
pub struct SpecificationInput {
    pub program: String,
    pub method: Option<String>,
    pub basis: Option<String>,
    pub driver: Option<String>,
    pub keywords: Value,
    pub protocols: Value,
    pub base_specification_id: Option<Id>,
}

impl SpecificationInput {
    /// Applies the lowercase invariant (data model invariant 7) to the
    /// case-sensitive enumeration fields at the boundary, before any
    /// canonicalization or hashing occurs.
    fn lowercased(mut self) -> Self {
        self.program = self.program.to_lowercase();
        self.method = self.method.map(|m| m.to_lowercase());
        self.basis = self.basis.map(|b| b.to_lowercase());
        self.driver = self.driver.map(|d| d.to_lowercase());
        self
    }

    fn content_value(&self) -> Value {
        json!({
            "program": self.program,
            "method": self.method,
            "basis": self.basis,
            "driver": self.driver,
            "keywords": self.keywords,
            "protocols": self.protocols,
            "base_specification_id": self.base_specification_id.map(|id| id.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternOutcome {
    Inserted,
    Existing,
}

/// Interns a single specification level. Insert-or-return by content
/// identity: `on conflict (content_hash) do nothing returning id`, falling
/// back to a lookup by the same `content_hash` when no row was returned
/// (§4.1). Specification rows are never mutated after insertion (invariant
/// 5), so an existing match is always content-identical to `input`.
pub async fn intern_specification(
    conn: &mut sqlx::PgConnection,
    ids: &IdSource,
    input: SpecificationInput,
) -> CoreResult<(InternOutcome, Id)> {
    let input = input.lowercased();
    let hash = content_hash(input.content_value())?;
    let new_id = ids.next();

    let inserted: Option<Id> = sqlx::query_scalar(
        r#"
        INSERT INTO specifications
            (id, program, method, basis, driver, keywords, protocols, base_specification_id, content_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (content_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(new_id)
    .bind(&input.program)
    .bind(&input.method)
    .bind(&input.basis)
    .bind(&input.driver)
    .bind(&input.keywords)
    .bind(&input.protocols)
    .bind(input.base_specification_id)
    .bind(&hash)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = inserted {
        return Ok((InternOutcome::Inserted, id));
    }

    let existing: Id =
        sqlx::query_scalar("SELECT id FROM specifications WHERE content_hash = $1")
            .bind(&hash)
            .fetch_one(&mut *conn)
            .await?;

    Ok((InternOutcome::Existing, existing))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SpecificationInput {
        SpecificationInput {
            program: "Psi4".into(),
            method: Some("B3LYP".into()),
            basis: Some("DEF2-SVP".into()),
            driver: Some("Energy".into()),
            keywords: json!({"maxiter": 200}),
            protocols: json!({}),
            base_specification_id: None,
        }
    }

    #[test]
    fn lowercasing_is_applied_to_enumerations_not_keywords() {
        let lowered = sample().lowercased();
        assert_eq!(lowered.program, "psi4");
        assert_eq!(lowered.method.as_deref(), Some("b3lyp"));
        assert_eq!(lowered.basis.as_deref(), Some("def2-svp"));
        assert_eq!(lowered.driver.as_deref(), Some("energy"));
    }

    #[test]
    fn content_value_is_stable_under_key_order() {
        let a = sample().lowercased();
        let mut b = sample().lowercased();
        b.keywords = json!({"maxiter": 200});
        assert_eq!(
            content_hash(a.content_value()).unwrap(),
            content_hash(b.content_value()).unwrap()
        );
    }
}
