//! Crate `flow`: motor de ejecución durable de flujos.
//!
//! Un flujo es una computación de larga duración que intercambia mensajes
//! con contrapartes y sobrevive a reinicios del proceso. El crate define:
//!
//! - el store de checkpoints con escritura condicional por versión
//!   (`CheckpointStore`) y una implementación en memoria para pruebas;
//! - el enrutamiento de flujos a shards (`ShardRouter`);
//! - el gestor de sesiones con deduplicación y orden por secuencia
//!   (`SessionManager`);
//! - la máquina de estados que ejecuta la lógica entre puntos de
//!   suspensión y escribe un checkpoint antes de cada efecto
//!   (`FlowStateMachine`);
//! - el hospital de fallos (`FlowHospital`), el modo drenaje
//!   (`DrainModeController`) y el supervisor que lo coordina todo
//!   (`FlowSupervisor`).
//!
//! Ejemplo rápido:
//! ```rust
//! use std::sync::Arc;
//! use flow::{FlowRegistry, FlowSupervisor, InMemoryCheckpointStore, RecordingTransport, SupervisorConfig};
//! let supervisor = FlowSupervisor::new(SupervisorConfig::default(),
//!                                      Arc::new(InMemoryCheckpointStore::new()),
//!                                      Arc::new(RecordingTransport::new()),
//!                                      Arc::new(FlowRegistry::new())).unwrap();
//! assert!(!supervisor.is_draining());
//! ```
pub mod codec;
pub mod config;
pub mod domain;
pub mod drain;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod events;
pub mod hospital;
pub mod locks;
pub mod logic;
pub mod registry;
pub mod repository;
pub mod service;
pub mod session;
pub mod shard;
pub mod stubs;
pub mod timers;
pub mod transport;

pub use codec::*;
pub use config::*;
pub use domain::*;
pub use drain::*;
pub use engine::*;
pub use errors::*;
pub use events::*;
pub use hospital::*;
pub use logic::*;
pub use registry::*;
pub use repository::*;
pub use service::*;
pub use session::*;
pub use shard::*;
pub use stubs::*;
pub use transport::*;
