//! The grid-optimization driver. Walks an n-dimensional grid of constrained
//! optimizations one "shell" at a time, starting from a seed point and
//! expanding outward to every neighbor not yet visited, faithfully following
//! the algorithm QCFractal's `gridoptimization/sockets.py` uses.
//!
//! Everything here is a pure function of its inputs — no database, no
//! async — so the grid math (the hardest part of this component) is
//! directly unit-testable.

use crate::error::{CoreError, CoreResult};
use gridserve_models::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use super::{ChildRequest, CompletedChild, Decision, DriverOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDimension {
    /// The constraint kind a manager understands: "dihedral", "angle", "distance".
    #[serde(rename = "type")]
    pub constraint_type: String,
    pub indices: Vec<i64>,
    pub step_type: StepType,
    pub steps: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridoptState {
    /// -2: not yet submitted a preoptimization. -1: preoptimization
    /// submitted, awaiting its result. 0: no preoptimization configured,
    /// starting grid not yet submitted. >=1: normal grid-expansion wave count.
    pub iteration: i64,
    pub complete: Vec<Vec<i64>>,
    pub dimensions: Vec<i64>,
    pub scans: Vec<ScanDimension>,
    pub preoptimization: bool,
    /// For relative-step dimensions, the measurement taken on the starting
    /// molecule that every step in that dimension is an offset from.
    pub reference_measurements: Vec<f64>,
}

/// Reads the `scans`/`preoptimization` keywords of the service's own
/// specification into the initial checkpoint state (§4.5: iteration `-2`
/// when `preoptimization` is set, else `0` — the two are mutually exclusive
/// branches gated on that one keyword, resolving the grid-optimization
/// open question).
pub fn initial_state(own_keywords: &Value) -> CoreResult<GridoptState> {
    let scans: Vec<ScanDimension> = serde_json::from_value(
        own_keywords
            .get("scans")
            .cloned()
            .ok_or_else(|| CoreError::developer_error("gridopt specification is missing `scans`"))?,
    )
    .map_err(|err| CoreError::developer_error(format!("invalid `scans` keyword: {err}")))?;
    let preoptimization = own_keywords
        .get("preoptimization")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let dimensions = scans.iter().map(|s| s.steps.len() as i64).collect();

    Ok(GridoptState {
        iteration: if preoptimization { -2 } else { 0 },
        complete: Vec::new(),
        dimensions,
        scans,
        preoptimization,
        reference_measurements: Vec::new(),
    })
}

pub fn serialize_key(point: &[i64]) -> String {
    serde_json::to_string(point).expect("a vec of i64 always serializes")
}

pub fn deserialize_key(key: &str) -> CoreResult<Vec<i64>> {
    serde_json::from_str(key)
        .map_err(|err| CoreError::developer_error(format!("corrupt grid key {key:?}: {err}")))
}

/// Looks up a precomputed geometric measurement for the given atom indices.
/// Computing the measurement itself (a dihedral/angle/distance from
/// Cartesian coordinates) is the manager's job, not the scheduler's; the
/// molecule document it returns is expected to carry a `measurements` map
/// keyed by dash-joined indices.
fn measure(molecule: &Value, indices: &[i64]) -> CoreResult<f64> {
    let key = indices
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join("-");
    molecule
        .get("measurements")
        .and_then(|m| m.get(&key))
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            CoreError::developer_error(format!(
                "molecule lacks a measurement for indices {indices:?}; the manager must report one"
            ))
        })
}

/// Finds the starting grid point: for each scan dimension, the step whose
/// value is closest to the starting molecule's current measurement
/// (absolute scans) or to zero (relative scans, which are always offsets
/// from that starting measurement).
fn calculate_starting_grid(scans: &[ScanDimension], molecule: &Value) -> CoreResult<(Vec<i64>, Vec<f64>)> {
    let mut point = Vec::with_capacity(scans.len());
    let mut references = Vec::with_capacity(scans.len());

    for scan in scans {
        let measurement = match scan.step_type {
            StepType::Absolute => measure(molecule, &scan.indices)?,
            StepType::Relative => 0.0,
        };
        references.push(if scan.step_type == StepType::Relative {
            measure(molecule, &scan.indices)?
        } else {
            0.0
        });

        let idx = scan
            .steps
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - measurement)
                    .abs()
                    .partial_cmp(&(*b - measurement).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx as i64)
            .ok_or_else(|| CoreError::developer_error("a scan dimension has no steps"))?;
        point.push(idx);
    }

    Ok((point, references))
}

/// Expands a set of completed grid points outward by one step in every
/// dimension, skipping points that fall outside the grid's bounds or that
/// are already complete. Returns `(parent_seed, new_point)` pairs so the
/// caller knows which completed optimization to seed each new point from.
pub fn expand_ndimensional_grid(
    dimensions: &[i64],
    seeds: &BTreeSet<Vec<i64>>,
    complete: &BTreeSet<Vec<i64>>,
) -> Vec<(Vec<i64>, Vec<i64>)> {
    let mut new_points = BTreeSet::new();

    for seed in seeds {
        for dim in 0..dimensions.len() {
            for disp in [1i64, -1i64] {
                let new_dim = seed[dim] + disp;
                if new_dim < 0 || new_dim >= dimensions[dim] {
                    continue;
                }
                let mut new_point = seed.clone();
                new_point[dim] = new_dim;
                if complete.contains(&new_point) {
                    continue;
                }
                new_points.insert((seed.clone(), new_point));
            }
        }
    }

    new_points.into_iter().collect()
}

fn build_constraints(scans: &[ScanDimension], references: &[f64], point: &[i64]) -> Value {
    let set: Vec<Value> = scans
        .iter()
        .zip(point)
        .enumerate()
        .map(|(dim, (scan, &idx))| {
            let value = match scan.step_type {
                StepType::Absolute => scan.steps[idx as usize],
                StepType::Relative => references[dim] + scan.steps[idx as usize],
            };
            serde_json::json!({
                "type": scan.constraint_type,
                "indices": scan.indices,
                "value": value,
            })
        })
        .collect();
    serde_json::json!({"set": set})
}

fn parse_state(state: &Value) -> CoreResult<GridoptState> {
    serde_json::from_value(state.clone())
        .map_err(|err| CoreError::developer_error(format!("corrupt gridopt service state: {err}")))
}

/// The per-wave decision function. `own_keywords` supplies `scans` and
/// `preoptimization` on the very first call (when `state` is still `null`);
/// thereafter the driver's own checkpoint carries them.
pub fn decide(
    state: &Value,
    own_keywords: &Value,
    initial_molecule: &Value,
    completed: &[CompletedChild],
    molecule_docs: &HashMap<Id, Value>,
) -> CoreResult<DriverOutcome> {
    let mut state = if state.is_null() {
        initial_state(own_keywords)?
    } else {
        parse_state(state)?
    };

    let outcome = match state.iteration {
        -2 => {
            state.iteration = -1;
            Decision::Submit(vec![ChildRequest {
                key: "preoptimization".to_string(),
                molecule: initial_molecule.clone(),
                constraints: None,
                child_type: gridserve_models::RecordType::Optimization,
            }])
        }
        -1 => {
            let preopt = completed
                .iter()
                .find(|c| c.key == "preoptimization")
                .ok_or_else(|| CoreError::developer_error("expected a completed preoptimization dependency"))?;
            let molecule_id = preopt.final_molecule_id.ok_or_else(|| {
                CoreError::developer_error("preoptimization did not report a final molecule")
            })?;
            let molecule = molecule_docs
                .get(&molecule_id)
                .ok_or_else(|| CoreError::developer_error("preoptimization's final molecule was not loaded"))?;

            let (start, references) = calculate_starting_grid(&state.scans, molecule)?;
            state.reference_measurements = references.clone();
            let constraints = build_constraints(&state.scans, &references, &start);

            state.iteration = 1;
            Decision::Submit(vec![ChildRequest {
                key: serialize_key(&start),
                molecule: molecule.clone(),
                constraints: Some(constraints),
                child_type: gridserve_models::RecordType::Optimization,
            }])
        }
        0 => {
            let (start, references) = calculate_starting_grid(&state.scans, initial_molecule)?;
            state.reference_measurements = references.clone();
            let constraints = build_constraints(&state.scans, &references, &start);

            state.iteration = 1;
            Decision::Submit(vec![ChildRequest {
                key: serialize_key(&start),
                molecule: initial_molecule.clone(),
                constraints: Some(constraints),
                child_type: gridserve_models::RecordType::Optimization,
            }])
        }
        _ => {
            let mut molecule_by_point: HashMap<Vec<i64>, Value> = HashMap::new();
            let mut seeds = BTreeSet::new();

            for child in completed {
                if child.key == "preoptimization" {
                    continue;
                }
                let point = deserialize_key(&child.key)?;
                if !state.complete.iter().any(|p| p == &point) {
                    state.complete.push(point.clone());
                }
                if let Some(molecule_id) = child.final_molecule_id {
                    if let Some(doc) = molecule_docs.get(&molecule_id) {
                        molecule_by_point.insert(point.clone(), doc.clone());
                    }
                }
                seeds.insert(point);
            }

            let complete_set: BTreeSet<Vec<i64>> = state.complete.iter().cloned().collect();
            let expansion = expand_ndimensional_grid(&state.dimensions, &seeds, &complete_set);

            if expansion.is_empty() {
                Decision::Done
            } else {
                let mut requests = Vec::with_capacity(expansion.len());
                for (parent, point) in expansion {
                    let seed_molecule = molecule_by_point.get(&parent).cloned().unwrap_or_else(|| initial_molecule.clone());
                    let constraints = build_constraints(&state.scans, &state.reference_measurements, &point);
                    requests.push(ChildRequest {
                        key: serialize_key(&point),
                        molecule: seed_molecule,
                        constraints: Some(constraints),
                        child_type: gridserve_models::RecordType::Optimization,
                    });
                }
                state.iteration += 1;
                Decision::Submit(requests)
            }
        }
    };

    Ok(DriverOutcome {
        decision: outcome,
        state: serde_json::to_value(&state)
            .map_err(|err| CoreError::developer_error(format!("failed to serialize gridopt state: {err}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<i64> {
        vec![3, 3]
    }

    #[test]
    fn second_wave_from_a_center_seed_yields_four_neighbors() {
        let seeds: BTreeSet<Vec<i64>> = [vec![1, 1]].into_iter().collect();
        let complete: BTreeSet<Vec<i64>> = [vec![1, 1]].into_iter().collect();
        let expansion = expand_ndimensional_grid(&dims(), &seeds, &complete);
        assert_eq!(expansion.len(), 4);
        let points: BTreeSet<Vec<i64>> = expansion.into_iter().map(|(_, p)| p).collect();
        assert!(points.contains(&vec![0, 1]));
        assert!(points.contains(&vec![2, 1]));
        assert!(points.contains(&vec![1, 0]));
        assert!(points.contains(&vec![1, 2]));
    }

    #[test]
    fn third_wave_from_the_four_edges_yields_the_four_corners() {
        let seeds: BTreeSet<Vec<i64>> = [vec![0, 1], vec![2, 1], vec![1, 0], vec![1, 2]]
            .into_iter()
            .collect();
        let complete: BTreeSet<Vec<i64>> = [vec![1, 1], vec![0, 1], vec![2, 1], vec![1, 0], vec![1, 2]]
            .into_iter()
            .collect();
        let expansion = expand_ndimensional_grid(&dims(), &seeds, &complete);
        let points: BTreeSet<Vec<i64>> = expansion.into_iter().map(|(_, p)| p).collect();
        assert_eq!(points.len(), 4);
        assert!(points.contains(&vec![0, 0]));
        assert!(points.contains(&vec![0, 2]));
        assert!(points.contains(&vec![2, 0]));
        assert!(points.contains(&vec![2, 2]));
    }

    #[test]
    fn edge_points_never_expand_out_of_bounds() {
        let seeds: BTreeSet<Vec<i64>> = [vec![0, 0]].into_iter().collect();
        let complete: BTreeSet<Vec<i64>> = [vec![0, 0]].into_iter().collect();
        let expansion = expand_ndimensional_grid(&dims(), &seeds, &complete);
        assert_eq!(expansion.len(), 2);
        for (_, point) in &expansion {
            assert!(point.iter().zip(&dims()).all(|(p, d)| *p >= 0 && p < d));
        }
    }

    #[test]
    fn a_fully_explored_grid_expands_to_nothing() {
        let dims = vec![2, 2];
        let all: BTreeSet<Vec<i64>> = [vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
            .into_iter()
            .collect();
        let expansion = expand_ndimensional_grid(&dims, &all, &all);
        assert!(expansion.is_empty());
    }

    #[test]
    fn key_round_trips() {
        let point = vec![1, 0, 2];
        let key = serialize_key(&point);
        assert_eq!(deserialize_key(&key).unwrap(), point);
    }

    #[test]
    fn starting_grid_picks_the_closest_absolute_step() {
        let scans = vec![ScanDimension {
            constraint_type: "dihedral".into(),
            indices: vec![0, 1, 2, 3],
            step_type: StepType::Absolute,
            steps: vec![-90.0, 0.0, 90.0],
        }];
        let molecule = serde_json::json!({"measurements": {"0-1-2-3": 88.0}});
        let (point, _) = calculate_starting_grid(&scans, &molecule).unwrap();
        assert_eq!(point, vec![2]);
    }

    #[test]
    fn preoptimization_selects_iteration_minus_two() {
        let keywords = serde_json::json!({
            "preoptimization": true,
            "scans": [{"type": "dihedral", "indices": [0,1,2,3], "step_type": "absolute", "steps": [-90.0, 0.0, 90.0]}],
        });
        let state = initial_state(&keywords).unwrap();
        assert_eq!(state.iteration, -2);
    }

    #[test]
    fn no_preoptimization_selects_iteration_zero() {
        let keywords = serde_json::json!({
            "preoptimization": false,
            "scans": [{"type": "dihedral", "indices": [0,1,2,3], "step_type": "absolute", "steps": [-90.0, 0.0, 90.0]}],
        });
        let state = initial_state(&keywords).unwrap();
        assert_eq!(state.iteration, 0);
    }
}
