//! Pipeline worker: consumes its input queues in order and without
//! duplicates, runs a stage over every message, and persists enough state to
//! resume after a crash without repeating or losing output.
pub mod chaos;
pub mod config;
pub mod mailer;
pub mod stage;
pub mod worker;
