//! Latency scenarios scored against the regional thresholds.
//!
//! These runs measure real operations against the in-process backend,
//! feed the durations through the recorder, and assert on the scored
//! summary: which rows pass, which thresholds apply, and where the
//! rendered artifact lands.
