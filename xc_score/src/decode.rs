use crate::{CircuitType, IndexMapping, OptimizationResult, ScoreError, Solution};

/// Decodes one engine solution, translating its indices through `mapping`.
pub fn decode_solution(
    solution: &Solution,
    mapping: &IndexMapping,
) -> Result<OptimizationResult, ScoreError> {
    let circuit = circuit_from_code(&solution.scoring.code).ok_or_else(|| {
        ScoreError::contract_violation(
            format!("unknown circuit code {:?}", solution.scoring.code),
            solution,
        )
    })?;

    let achieved = solution.closing.map(|cp| cp.distance);
    let relative = match (solution.scoring.closing_distance_relative, solution.distance) {
        (Some(ratio), Some(distance)) => Some(ratio * distance),
        _ => None,
    };
    let closing_radius_m =
        closing_threshold(achieved, solution.scoring.closing_distance_fixed, relative)
            .map(|km| km * 1000.0);

    Ok(OptimizationResult {
        score: solution.score.unwrap_or(0.0),
        length_km: solution.distance.unwrap_or(0.0),
        multiplier: solution.scoring.multiplier,
        circuit: Some(circuit),
        closing_radius_m,
        solution_indices: solution_indices(solution, mapping)?,
        optimal: solution.optimal.unwrap_or(false),
    })
}

pub fn circuit_from_code(code: &str) -> Option<CircuitType> {
    match code {
        "od" => Some(CircuitType::OpenDistance),
        "tri" => Some(CircuitType::FlatTriangle),
        "fai" => Some(CircuitType::FaiTriangle),
        "oar" => Some(CircuitType::OutAndReturn),
        _ => None,
    }
}

/// Picks the tightest closing threshold the flight actually satisfied: the
/// smallest candidate strictly greater than the achieved closing distance.
pub fn closing_threshold(
    achieved: Option<f64>,
    fixed: Option<f64>,
    relative: Option<f64>,
) -> Option<f64> {
    let achieved = achieved?;
    [fixed, relative]
        .into_iter()
        .flatten()
        .filter(|&threshold| threshold > achieved)
        .reduce(f64::min)
}

// Order is start, closing-in, turnpoints, closing-out, finish.
fn solution_indices(
    solution: &Solution,
    mapping: &IndexMapping,
) -> Result<Vec<usize>, ScoreError> {
    let engine_indices = solution
        .start
        .into_iter()
        .chain(solution.closing.map(|cp| cp.entry))
        .chain(solution.turnpoints.iter().copied())
        .chain(solution.closing.map(|cp| cp.exit))
        .chain(solution.finish);

    engine_indices
        .map(|index| {
            mapping.original_index(index).ok_or_else(|| {
                ScoreError::contract_violation(
                    format!(
                        "index {} outside flight log of {} fixes",
                        index,
                        mapping.engine_len()
                    ),
                    solution,
                )
            })
        })
        .collect()
}
