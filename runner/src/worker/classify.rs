//! Compatibility layer for tools that only report through free-form logs.
//!
//! The simulation and reconstruction programs signal failures with a plain
//! exit code and a handful of well known log lines. The functions here turn
//! that into a `StepResult` for the worker state machine.

pub const DATABASE_FAILURE: &str = "Database connection failed";
pub const SUBSTEP_FAILURE: &str = "Convergence is requiring too many substeps";
pub const OUT_OF_EVENTS: &str = "Error when reading hep file; probably ran out of events";

/// lines at the end of the log searched for the last processed event
const TAIL_LINES: usize = 20;

/// Raw result of running an external step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: i32,
    pub log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DatabaseUnavailable,
    ConvergenceFailure,
    /// ran out of input before producing a single event
    InputExhausted,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success,
    /// input ran out after `last_event`, everything before it is usable
    Partial { last_event: u64 },
    Failure { kind: FailureKind, detail: String },
}

/// Classify a simulation run starting at `start_event`.
///
/// Patterns are checked in priority order; an exhausted input only counts as
/// a failure if not a single event was simulated.
pub fn classify_simulation(output: &StepOutput, start_event: u64) -> StepResult {
    if output.exit_code == 0 {
        return StepResult::Success;
    }

    let failure = |kind, detail: &str| StepResult::Failure {
        kind,
        detail: detail.to_string(),
    };

    if output.log.contains(DATABASE_FAILURE) {
        failure(FailureKind::DatabaseUnavailable, DATABASE_FAILURE)
    } else if output.log.contains(SUBSTEP_FAILURE) {
        failure(FailureKind::ConvergenceFailure, SUBSTEP_FAILURE)
    } else if output.log.contains(OUT_OF_EVENTS) {
        match last_event(&output.log) {
            Some(last_event) if last_event > start_event => StepResult::Partial { last_event },
            Some(last_event) => failure(
                FailureKind::InputExhausted,
                &format!("Run out of events: {last_event}"),
            ),
            None => failure(FailureKind::InputExhausted, "no processed event found"),
        }
    } else {
        failure(
            FailureKind::Generic,
            &format!("exited with {}", output.exit_code),
        )
    }
}

/// Number of the last event mentioned at the end of the log, the fifth field
/// of the latest line containing `Event`
pub fn last_event(log: &str) -> Option<u64> {
    log.lines()
        .rev()
        .take(TAIL_LINES)
        .filter(|line| line.contains("Event"))
        .find_map(|line| line.split_whitespace().nth(4)?.parse().ok())
}

/// Both phrasings the output processor uses to confirm `events` written events
pub fn success_markers(events: u64) -> [String; 2] {
    [
        format!("MyLCIOOutputProcessor: {events} events in 1 runs written to file"),
        format!("MyLCIOOutputProcessor: +{events} events in +1 runs written to file"),
    ]
}

/// whether the reconstruction log confirms `events` written events
pub fn reconstruction_succeeded(log: &str, events: u64) -> bool {
    let markers = success_markers(events);

    log.lines()
        .any(|line| markers.iter().any(|marker| line.contains(marker.as_str())))
}
