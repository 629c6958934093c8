//! flow-workflows: flujos concretos sobre el motor `flow`
//!
//! Define las lógicas de flujo incluidas (intercambio ping-pong,
//! difusión a varias contrapartes, temporizador y orquestación de
//! subflujos), el adaptador `Typed` que guarda un estado tipado dentro de
//! la continuación y la fábrica del registro con sus validadores.

pub mod errors;
pub mod factory;
pub mod flow_kind;
pub mod flows;
pub mod typed;

pub use errors::WorkflowError;
pub use factory::{builtin_registry, descriptor, FlowWorkflowFactory};
pub use flow_kind::FlowKind;
pub use typed::{Typed, TypedFlow};
