/*
    Metrics - connection and correlation metrics for monitoring

    Provides counters and gauges for:
    - Traffic (frames sent and received, by wire type)
    - Inbound failures (undecodable frames, dropped payloads)
    - Correlation (waits resolved by outcome, pending waits per registry)
    - Connection health (state transitions, reconnects, keepalive failures)

    Only the `metrics` facade is used here; installing a recorder is left to
    the embedding application.
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "selfid_frames_sent_total",
        "Total number of frames written to the relay, labeled by type"
    );

    describe_counter!(
        "selfid_frames_received_total",
        "Total number of frames read from the relay, labeled by type"
    );

    describe_counter!(
        "selfid_decode_failures_total",
        "Total number of inbound frames that could not be decoded, labeled by reason (empty, too_large, malformed, unknown_type)"
    );

    describe_counter!(
        "selfid_payloads_dropped_total",
        "Total number of MSG frames dropped after decoding, labeled by reason (invalid_envelope, unknown_kind, no_observer)"
    );

    describe_counter!(
        "selfid_waits_resolved_total",
        "Total number of correlated waits resolved, labeled by registry and outcome"
    );

    describe_gauge!(
        "selfid_pending_waits",
        "Current number of pending waits, labeled by registry"
    );

    describe_counter!(
        "selfid_connection_state_changes_total",
        "Total number of connection state transitions, labeled by target state"
    );

    describe_counter!(
        "selfid_reconnects_total",
        "Total number of reconnection attempts"
    );

    describe_counter!(
        "selfid_keepalive_failures_total",
        "Total number of keepalive pings that could not be written"
    );
}

pub fn frame_sent(msg_type: &'static str) {
    counter!("selfid_frames_sent_total", "type" => msg_type).increment(1);
}

pub fn frame_received(msg_type: &'static str) {
    counter!("selfid_frames_received_total", "type" => msg_type).increment(1);
}

pub fn decode_failure(reason: &'static str) {
    counter!("selfid_decode_failures_total", "reason" => reason).increment(1);
}

pub fn payload_dropped(reason: &'static str) {
    counter!("selfid_payloads_dropped_total", "reason" => reason).increment(1);
}

pub fn wait_resolved(registry: &'static str, outcome: &'static str) {
    counter!("selfid_waits_resolved_total", "registry" => registry, "outcome" => outcome)
        .increment(1);
}

pub fn set_pending_waits(registry: &'static str, count: usize) {
    gauge!("selfid_pending_waits", "registry" => registry).set(count as f64);
}

pub fn state_changed(state: &'static str) {
    counter!("selfid_connection_state_changes_total", "state" => state).increment(1);
}

pub fn reconnect_attempted() {
    counter!("selfid_reconnects_total").increment(1);
}

pub fn keepalive_failed() {
    counter!("selfid_keepalive_failures_total").increment(1);
}
