//! Worker pool lifecycle scenarios.
//!
//! Creation, reuse, teardown and re-creation across batches, plus the
//! storage and identity guarantees that make re-runs reproducible:
//! the same name always maps to the same account, and a second
//! installation of a name shares the account but never the database.
