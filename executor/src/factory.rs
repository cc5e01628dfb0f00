use std::{collections::HashMap, sync::Arc};

use crate::error::{ExecutorError, Result};
use crate::task::Task;

type TaskConstructor = Box<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// Tabla tipo de tarea -> constructor. Se llena al arrancar el proceso.
#[derive(Default)]
pub struct TaskFactory {
    constructors: HashMap<String, TaskConstructor>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra (o reemplaza) el constructor de un tipo de tarea.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Task> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
        self
    }

    /// Devuelve una instancia nueva cada vez.
    pub fn create(&self, kind: &str) -> Result<Arc<dyn Task>> {
        self.constructors
            .get(kind)
            .map(|constructor| constructor())
            .ok_or_else(|| ExecutorError::UnknownTaskKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
