use tumbler_common::ProjectState;

use crate::config::LoopConfig;

/// What happens after a verification.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Refine: run another engineering iteration with feedback.
    Continue,
    /// Threshold met or iteration cap reached; archive and stop.
    Completed,
    /// Budget exhausted (cost or plateau); stop without archiving.
    Failed(String),
}

/// Decide the next step. Checks run in a fixed order: cost ceiling, score
/// plateau, then completion. Limits come from `state`; `config` supplies the
/// plateau window.
pub fn evaluate(state: &ProjectState, total_cost: f64, config: &LoopConfig) -> Outcome {
    let budget = state.max_cost;
    if budget > 0.0 && total_cost >= budget {
        return Outcome::Failed(format!(
            "Cost limit exceeded: ${:.4} >= ${:.2}",
            total_cost, budget
        ));
    }

    if let Some(window) = plateau(&state.scores, config.plateau_window, config.plateau_delta) {
        let formatted: Vec<String> = window.iter().map(|s| format!("{:.1}", s)).collect();
        return Outcome::Failed(format!(
            "Score plateau: [{}] varied by less than {} over {} iterations",
            formatted.join(", "),
            config.plateau_delta,
            window.len()
        ));
    }

    if state.is_complete() {
        return Outcome::Completed;
    }
    Outcome::Continue
}

/// The last `window` scores when they span less than `delta`.
fn plateau(scores: &[f64], window: usize, delta: f64) -> Option<&[f64]> {
    if window < 2 || scores.len() < window {
        return None;
    }
    let recent = &scores[scores.len() - window..];
    let max = recent.iter().copied().fold(f64::MIN, f64::max);
    let min = recent.iter().copied().fold(f64::MAX, f64::min);
    (max - min < delta).then_some(recent)
}
