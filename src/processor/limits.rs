//! Step budget for one turn.

pub const DEFAULT_MAX_STEPS: usize = 8;
pub const MAX_STEPS_HARD_CAP: usize = 24;

/// Clamp an agent's configured step limit. Missing or non-positive values
/// fall back to the default.
pub fn resolve_max_steps(configured: Option<i64>) -> usize {
    match configured {
        Some(steps) if steps > 0 => usize::try_from(steps)
            .unwrap_or(MAX_STEPS_HARD_CAP)
            .min(MAX_STEPS_HARD_CAP),
        _ => DEFAULT_MAX_STEPS,
    }
}
