use crate::model::{FlowSnapshot, Timings};

/// Sentinel for phases whose timestamp pair the engine did not provide.
pub const UNMEASURED: i64 = -1;

/// Derive the seven timing phases from a flow's timestamps.
///
/// Each phase is the difference of one timestamp pair, rounded to integer
/// milliseconds and clamped to zero: clock skew or event reordering must
/// never produce a negative duration. A missing timestamp on either side
/// yields [`UNMEASURED`]. `blocked` and `dns` stay zero-filled so the record
/// shape is stable for downstream parsers.
pub fn reconstruct_timings(snapshot: &FlowSnapshot) -> Timings {
    let (connect, ssl) = match &snapshot.server {
        // Connection-phase timings are only meaningful once the connection
        // actually completed (both endpoints of its lifetime are known).
        Some(s) if s.timestamp_start.is_some() && s.timestamp_end.is_some() => (
            phase(s.timestamp_start, s.timestamp_tcp_setup),
            phase(s.timestamp_tcp_setup, s.timestamp_tls_setup),
        ),
        _ => (UNMEASURED, UNMEASURED),
    };

    let send = phase(
        snapshot.request.timestamp_start,
        snapshot.request.timestamp_end,
    );
    let (wait, receive) = match &snapshot.response {
        Some(r) => (
            phase(snapshot.request.timestamp_end, r.timestamp_start),
            phase(r.timestamp_start, r.timestamp_end),
        ),
        None => (UNMEASURED, UNMEASURED),
    };

    Timings {
        blocked: 0,
        dns: 0,
        connect,
        ssl,
        send,
        wait,
        receive,
    }
}

/// Millisecond duration between two epoch-second timestamps, clamped to
/// non-negative; [`UNMEASURED`] when either side is missing.
fn phase(start: Option<f64>, end: Option<f64>) -> i64 {
    match (start, end) {
        (Some(start), Some(end)) => (((end - start) * 1000.0).round() as i64).max(0),
        _ => UNMEASURED,
    }
}
