use std::{collections::HashMap, time::Duration};

use common::TaskStatus;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::context::JobContext;

/// Unidad de trabajo polimórfica.
///
/// Los métodos son bloqueantes: el executor llama a `start` desde un hilo
/// de bloqueo y la tarea puede hacer E/S libremente. El resto de métodos se
/// llama desde otros hilos mientras `start` corre, así que el estado va con
/// mutabilidad interior.
pub trait Task: Send + Sync {
    /// Corre hasta terminar o hasta que la paren. No vuelve antes de tiempo.
    /// Devuelve si terminó bien; un fallo deja el estado en FAILED.
    fn start(&self, context: &JobContext) -> bool;

    /// Pide una cancelación cooperativa y vuelve cuando la tarea paró
    /// (o la aceptó). `true` si la tarea ya no está corriendo.
    fn stop(&self) -> bool;

    /// Cambia parámetros en caliente. `true` si se aplicaron.
    fn modify(&self, parameters: &HashMap<String, String>) -> bool;

    fn status(&self) -> TaskStatus;

    /// Porcentaje en [0, 100]
    fn progress(&self) -> f64;

    fn task_result(&self) -> Value;

    /// Libera recursos propios. El executor lo llama exactamente una vez.
    fn close(&self);
}

/// Estado de una tarea protegido por la máquina de estados de `TaskStatus`.
/// Un estado terminal ya no cambia.
#[derive(Debug)]
pub struct StatusCell {
    status: Mutex<TaskStatus>,
    changed: Condvar,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Preparing),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> TaskStatus {
        *self.status.lock()
    }

    /// Aplica la transición si es válida desde el estado actual.
    pub fn transition(&self, next: TaskStatus) -> bool {
        let mut current = self.status.lock();
        if !current.can_transition_to(next) {
            return false;
        }
        *current = next;
        self.changed.notify_all();
        true
    }

    /// Sólo transiciona si el estado actual es `expected`.
    pub fn compare_and_set(&self, expected: TaskStatus, next: TaskStatus) -> bool {
        let mut current = self.status.lock();
        if *current != expected || !current.can_transition_to(next) {
            return false;
        }
        *current = next;
        self.changed.notify_all();
        true
    }

    /// Espera como mucho `timeout` a que el estado sea terminal y devuelve
    /// el último estado observado.
    pub fn wait_terminal(&self, timeout: Duration) -> TaskStatus {
        let mut current = self.status.lock();
        if !current.is_terminal() {
            self.changed
                .wait_while_for(&mut current, |s| !s.is_terminal(), timeout);
        }
        *current
    }
}
