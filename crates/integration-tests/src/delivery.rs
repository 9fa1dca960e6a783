//! End-to-end delivery scenarios.
//!
//! The baseline correctness suite: a sender pushes a numbered batch
//! into a conversation and every receiver must observe the full batch,
//! in order, through whichever read path the scenario exercises
//! (live stream, poll, or recovery after downtime).
