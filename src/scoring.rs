use crate::models::{Constraints, FacultyProfile};

pub fn department_weight(constraints: &Constraints, department: &str) -> f64 {
    constraints
        .department_weighting
        .get(department)
        .copied()
        .unwrap_or(1.0)
}

pub fn designation_weight(constraints: &Constraints, designation: &str) -> f64 {
    constraints
        .designation_weighting
        .get(designation)
        .copied()
        .unwrap_or(1.0)
}

/// Desirability of a candidate for the next unit. Higher is better;
/// both load terms shrink the score as the candidate takes on work.
pub fn candidate_score(
    profile: &FacultyProfile,
    constraints: &Constraints,
    cumulative_load: i64,
    day_count: i64,
) -> f64 {
    let load_penalty = 1.0 / (1.0 + cumulative_load.max(0) as f64);
    let day_penalty = 1.0 / (1.0 + day_count.max(0) as f64);

    department_weight(constraints, &profile.department)
        * designation_weight(constraints, &profile.designation)
        * load_penalty
        * day_penalty
}

/// Index of the highest score; the first of equal maxima wins.
pub fn pick_best<I>(scores: I) -> Option<usize>
where
    I: IntoIterator<Item = (usize, f64)>,
{
    let mut best: Option<(usize, f64)> = None;
    for (index, score) in scores {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}
