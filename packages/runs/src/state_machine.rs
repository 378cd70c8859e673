// ABOUTME: Run status transition table
// ABOUTME: Pure validation used by the run manager before every status write

use crate::types::RunStatus;

/// Statuses reachable in one step from `from`. Terminal statuses have none.
pub fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
    match from {
        RunStatus::Booting => &[RunStatus::Running, RunStatus::Failed, RunStatus::Canceled],
        RunStatus::Running => &[
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ],
        RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled => &[],
    }
}

/// Whether `from -> to` is a legal step.
///
/// Callers treat `from == to` as a no-op and must not ask.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn transition_error(from: RunStatus, to: RunStatus) -> String {
    if from.is_terminal() {
        return format!("Cannot transition from terminal state '{}'", from);
    }

    let allowed = allowed_transitions(from)
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Invalid transition from '{}' to '{}'. Allowed: {}",
        from, to, allowed
    )
}
