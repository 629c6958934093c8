//! Persistencia durable de checkpoints sobre Diesel.
//! Este archivo expone el módulo `schema` y reexporta el store Diesel que
//! implementa `flow::CheckpointStore`. La implementación está en
//! `checkpoint_persistence.rs`; el backend es SQLite salvo que se compile
//! con la feature `pg`.

mod checkpoint_persistence;
pub mod schema;

pub use checkpoint_persistence::{new_from_env, DieselCheckpointStore, DEFAULT_POOL_SIZE, DEFAULT_SQLITE_PATH, MIGRATIONS};
