//! Dobles de prueba compartidos por los tests del crate.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use async_trait::async_trait;
use common::TaskStatus;
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};

use crate::context::JobContext;
use crate::error::{ExecutorError, Result};
use crate::reporter::{ReportEndpoint, TaskReporter};
use crate::task::{StatusCell, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    /// bloquea hasta `release()` (DONE) o hasta que lo cancelen
    Block,
    /// termina al toque en el estado indicado
    Finish(TaskStatus),
    /// devuelve false sin tocar el estado
    ReturnFalse,
    Panic,
}

/// Tarea manejable desde el test.
pub struct ScriptedTask {
    status: StatusCell,
    behavior: StartBehavior,
    progress: Mutex<f64>,
    released: Mutex<bool>,
    wake: Condvar,
    canceled: AtomicBool,
    ignore_stop: bool,
    stop_delay: Duration,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub closes: AtomicUsize,
    pub modifications: Mutex<Vec<HashMap<String, String>>>,
}

impl Default for ScriptedTask {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTask {
    pub fn new() -> Self {
        Self::with_behavior(StartBehavior::Block)
    }

    pub fn with_behavior(behavior: StartBehavior) -> Self {
        Self {
            status: StatusCell::new(),
            behavior,
            progress: Mutex::new(0.0),
            released: Mutex::new(false),
            wake: Condvar::new(),
            canceled: AtomicBool::new(false),
            ignore_stop: false,
            stop_delay: Duration::ZERO,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            modifications: Mutex::new(Vec::new()),
        }
    }

    /// `stop` duerme `delay` antes de hacer nada.
    pub fn slow_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// `stop` no tiene efecto: la tarea sigue hasta `release()`.
    pub fn ignoring_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    pub fn release(&self) {
        *self.released.lock() = true;
        self.wake.notify_all();
    }

    pub fn set_status(&self, status: TaskStatus) -> bool {
        self.status.transition(status)
    }

    pub fn set_progress(&self, progress: f64) {
        *self.progress.lock() = progress;
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Task for ScriptedTask {
    fn start(&self, _context: &JobContext) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            StartBehavior::Panic => panic!("boom"),
            StartBehavior::ReturnFalse => false,
            StartBehavior::Finish(status) => {
                if !self.status.transition(TaskStatus::Running) {
                    return false;
                }
                self.status.transition(status);
                status == TaskStatus::Done
            }
            StartBehavior::Block => {
                if !self.status.transition(TaskStatus::Running) {
                    return false;
                }
                let mut released = self.released.lock();
                while !*released && !self.canceled.load(Ordering::SeqCst) {
                    self.wake.wait_for(&mut released, Duration::from_millis(20));
                }
                if *released {
                    self.status.transition(TaskStatus::Done)
                } else {
                    self.status.transition(TaskStatus::Canceled);
                    false
                }
            }
        }
    }

    fn stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            thread::sleep(self.stop_delay);
        }
        if self.ignore_stop {
            return self.status.get().is_terminal();
        }
        self.canceled.store(true, Ordering::SeqCst);
        self.wake.notify_all();
        if self.status.get().is_terminal() {
            return true;
        }
        if self
            .status
            .compare_and_set(TaskStatus::Preparing, TaskStatus::Canceled)
        {
            return true;
        }
        self.status.transition(TaskStatus::Canceling);
        self.status.wait_terminal(Duration::from_secs(5)).is_terminal()
    }

    fn modify(&self, parameters: &HashMap<String, String>) -> bool {
        self.modifications.lock().push(parameters.clone());
        true
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    fn progress(&self) -> f64 {
        *self.progress.lock()
    }

    fn task_result(&self) -> Value {
        json!({ "scripted": true })
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reporter que guarda todo lo que recibe. Las primeras `fail_first`
/// llamadas a cada endpoint fallan; después confirma con `ack`.
pub struct RecordingReporter {
    fail_first: usize,
    ack: AtomicBool,
    calls: Mutex<HashMap<ReportEndpoint, usize>>,
    received: Mutex<Vec<(ReportEndpoint, Value)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ack: AtomicBool::new(true),
            calls: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ack(&self, ack: bool) {
        self.ack.store(ack, Ordering::SeqCst);
    }

    /// Payloads entregados con éxito a un endpoint.
    pub fn delivered(&self, endpoint: ReportEndpoint) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn calls(&self, endpoint: ReportEndpoint) -> usize {
        self.calls.lock().get(&endpoint).copied().unwrap_or(0)
    }

    /// Reportes de resultado entregados con estado terminal.
    pub fn terminal_reports(&self) -> Vec<Value> {
        self.delivered(ReportEndpoint::TaskResultUpload)
            .into_iter()
            .filter(|payload| {
                serde_json::from_value::<TaskStatus>(payload["status"].clone())
                    .map(|s| s.is_terminal())
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[async_trait]
impl TaskReporter for RecordingReporter {
    async fn report(&self, endpoint: ReportEndpoint, payload: Value) -> Result<bool> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(endpoint).or_insert(0);
            *count += 1;
            *count
        };
        if call <= self.fail_first {
            return Err(ExecutorError::Internal("coordinador caído".to_string()));
        }
        if !self.ack.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.received.lock().push((endpoint, payload));
        Ok(true)
    }
}
