//! The flat-wave driver shared by `torsion`, `neb`, `reaction`, and
//! `manybody` records (§4.5 SUPPLEMENT). Unlike grid-optimization, these
//! procedures don't expand a search space iteration by iteration: the set of
//! points to compute is fixed up front (rotamers along a torsion scan, NEB
//! images, reaction-complex geometries, n-body fragment subsets), so the
//! driver's whole job is to submit every point in a single wave and
//! recognize when they've all come back.
//!
//! Generating the actual geometries for those points is a numerical-
//! chemistry concern out of scope here; the driver consumes them as opaque
//! molecule documents already attached to its initial state by the
//! submission path.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChildRequest, CompletedChild, Decision, DriverOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatWaveState {
    /// (key, seed molecule) pairs, consumed by the first call to `decide`.
    pub points: Vec<(String, Value)>,
    pub submitted: bool,
}

fn parse_state(state: &Value) -> CoreResult<FlatWaveState> {
    serde_json::from_value(state.clone())
        .map_err(|err| CoreError::developer_error(format!("corrupt flat-wave service state: {err}")))
}

pub fn decide(state: &Value, completed: &[CompletedChild]) -> CoreResult<DriverOutcome> {
    let mut parsed = parse_state(state)?;

    let decision = if !parsed.submitted {
        if parsed.points.is_empty() {
            return Err(CoreError::developer_error(
                "a flat-wave service must be created with at least one point",
            ));
        }
        let requests = parsed
            .points
            .drain(..)
            .map(|(key, molecule)| ChildRequest {
                key,
                molecule,
                constraints: None,
                child_type: gridserve_models::RecordType::Single,
            })
            .collect();
        parsed.submitted = true;
        Decision::Submit(requests)
    } else {
        // Eligibility already guarantees every dependency is terminal by
        // the time `decide` runs again, so a second call always means the
        // single wave is done.
        let _ = completed;
        Decision::Done
    };

    Ok(DriverOutcome {
        decision,
        state: serde_json::to_value(&parsed)
            .map_err(|err| CoreError::developer_error(format!("failed to serialize flat-wave state: {err}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridserve_models::RecordStatus;

    fn completed(key: &str) -> CompletedChild {
        CompletedChild {
            key: key.to_string(),
            status: RecordStatus::Complete,
            final_molecule_id: None,
        }
    }

    #[test]
    fn first_call_submits_every_point_at_once() {
        let state = serde_json::json!({
            "points": [["a", {"symbols": []}], ["b", {"symbols": []}]],
            "submitted": false,
        });
        let outcome = decide(&state, &[]).unwrap();
        match outcome.decision {
            Decision::Submit(children) => assert_eq!(children.len(), 2),
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn second_call_after_submission_completes() {
        let state = serde_json::json!({"points": [], "submitted": true});
        let outcome = decide(&state, &[completed("a"), completed("b")]).unwrap();
        assert!(matches!(outcome.decision, Decision::Done));
    }
}
