//! Durable job storage.
//!
//! [`sqlite::SqliteJobStore`] implements [`gleaner_core::JobStore`] on top of
//! SQLite.  The server picks it when `GLEANER_DATABASE_URL` is a `sqlite:`
//! URL and falls back to the in-memory store otherwise.

pub mod sqlite;
