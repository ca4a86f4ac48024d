use tracing::trace;

// Counters are emitted as trace events; a subscriber can aggregate them.

pub fn lot_outcome(stage: &'static str, ok: bool) {
    trace!(
        target = "scout.metrics",
        stage = stage,
        ok = ok,
        "lot_outcome_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "scout.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn inference_attempt(attempt: u32, transient: bool) {
    trace!(
        target = "scout.metrics",
        attempt = attempt,
        transient = transient,
        "inference_attempt_failed"
    );
}
