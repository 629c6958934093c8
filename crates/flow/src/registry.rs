// Archivo: registry.rs
// Propósito: registro de lógicas de flujo por nombre, con validación
// opcional de argumentos antes de admitir un flujo.
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::errors::{FlowError, Result};
use crate::logic::FlowLogic;

/// Validador de argumentos: recibe los argumentos y las opciones con las
/// que se registró la lógica; devuelve los argumentos normalizados o la
/// lista de problemas encontrados.
pub type Validator = fn(&JsonValue, Option<&JsonValue>) -> std::result::Result<JsonValue, Vec<String>>;

/// Qué ejecutar: nombre de la lógica registrada y sus argumentos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub logic: String,
    #[serde(default)]
    pub args: JsonValue,
}

impl FlowDescriptor {
    pub fn new(logic: impl Into<String>, args: JsonValue) -> Self {
        Self { logic: logic.into(),
               args }
    }
}

struct Registration {
    logic: Arc<dyn FlowLogic>,
    validator: Option<Validator>,
    options: Option<JsonValue>,
}

/// Registro inmutable una vez entregado al supervisor. Mantiene el orden de
/// inserción para listados de operador.
#[derive(Default)]
pub struct FlowRegistry {
    flows: IndexMap<String, Registration>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una lógica bajo su `name()`. Un segundo registro con el
    /// mismo nombre reemplaza al anterior.
    pub fn register(&mut self, logic: Arc<dyn FlowLogic>) -> &mut Self {
        self.register_with_validator(logic, None, None)
    }

    pub fn register_with_validator(&mut self,
                                   logic: Arc<dyn FlowLogic>,
                                   validator: Option<Validator>,
                                   options: Option<JsonValue>)
                                   -> &mut Self {
        let name = logic.name().to_string();
        if self.flows.contains_key(&name) {
            log::warn!("registry: reemplazando logica ya registrada '{}'", name);
        }
        self.flows.insert(name,
                          Registration { logic,
                                         validator,
                                         options });
        self
    }

    pub fn logic(&self, name: &str) -> Result<Arc<dyn FlowLogic>> {
        self.flows
            .get(name)
            .map(|r| r.logic.clone())
            .ok_or_else(|| FlowError::NotFound(format!("logica de flujo '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }

    /// Resuelve la lógica y aplica su validador (si tiene). Devuelve el
    /// descriptor con los argumentos normalizados.
    pub fn validate(&self, descriptor: &FlowDescriptor) -> Result<FlowDescriptor> {
        let reg = self.flows
                      .get(&descriptor.logic)
                      .ok_or_else(|| FlowError::Validation(format!("logica de flujo no registrada: '{}'", descriptor.logic)))?;
        let args = match reg.validator {
            Some(v) => v(&descriptor.args, reg.options.as_ref()).map_err(|errs| FlowError::Validation(format!("{}: {}", descriptor.logic, errs.join("; "))))?,
            None => descriptor.args.clone(),
        };
        Ok(FlowDescriptor { logic: descriptor.logic.clone(),
                            args })
    }
}
