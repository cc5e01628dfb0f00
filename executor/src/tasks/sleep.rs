use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use common::job::{PARAM_POLL_MILLIS, PARAM_SLEEP_MILLIS};
use common::TaskStatus;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::JobContext;
use crate::task::{StatusCell, Task};

const DEFAULT_SLEEP_MILLIS: u64 = 5000;
const DEFAULT_POLL_MILLIS: u64 = 100;
const STOP_WAIT: Duration = Duration::from_secs(30);

/// Tarea que espera `sleepMillis` revisando la cancelación cada `pollMillis`.
/// Sirve para probar timeouts, cancelaciones y el pool.
#[derive(Debug)]
pub struct SleepTask {
    status: StatusCell,
    canceled: AtomicBool,
    sleep_millis: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    slept_millis: AtomicU64,
}

impl Default for SleepTask {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepTask {
    pub fn new() -> Self {
        Self {
            status: StatusCell::new(),
            canceled: AtomicBool::new(false),
            sleep_millis: AtomicU64::new(DEFAULT_SLEEP_MILLIS),
            started_at: Mutex::new(None),
            slept_millis: AtomicU64::new(0),
        }
    }

    fn parse_millis(context: &JobContext, key: &str, default: u64) -> u64 {
        match context.parameter(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("parámetro {} inválido ({:?}), uso {}", key, raw, default);
                default
            }),
        }
    }
}

impl Task for SleepTask {
    fn start(&self, context: &JobContext) -> bool {
        if !self.status.transition(TaskStatus::Running) {
            info!("tarea {} cancelada antes de arrancar", context.identity());
            return false;
        }

        let sleep = Self::parse_millis(context, PARAM_SLEEP_MILLIS, DEFAULT_SLEEP_MILLIS);
        let poll = Self::parse_millis(context, PARAM_POLL_MILLIS, DEFAULT_POLL_MILLIS).max(1);
        let poll = Duration::from_millis(poll);
        self.sleep_millis.store(sleep, Ordering::SeqCst);

        let begin = Instant::now();
        *self.started_at.lock() = Some(begin);
        info!("durmiendo {}ms (poll={:?})", sleep, poll);

        loop {
            if self.canceled.load(Ordering::SeqCst) {
                self.status.transition(TaskStatus::Canceled);
                info!("cancelación aceptada tras {:?}", begin.elapsed());
                return false;
            }
            let elapsed = begin.elapsed().as_millis() as u64;
            self.slept_millis.store(elapsed, Ordering::SeqCst);
            // se relee en cada vuelta: modify puede cambiarlo
            if elapsed >= self.sleep_millis.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(poll);
        }

        self.status.transition(TaskStatus::Done)
    }

    fn stop(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if self.status.get().is_terminal() {
            return true;
        }
        // nunca arrancó: se cancela directamente
        if self
            .status
            .compare_and_set(TaskStatus::Preparing, TaskStatus::Canceled)
        {
            return true;
        }
        self.status.transition(TaskStatus::Canceling);
        self.status.wait_terminal(STOP_WAIT).is_terminal()
    }

    fn modify(&self, parameters: &HashMap<String, String>) -> bool {
        let Some(raw) = parameters.get(PARAM_SLEEP_MILLIS) else {
            return false;
        };
        match raw.trim().parse::<u64>() {
            Ok(millis) => {
                self.sleep_millis.store(millis, Ordering::SeqCst);
                info!("sleepMillis modificado a {}", millis);
                true
            }
            Err(_) => false,
        }
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    fn progress(&self) -> f64 {
        if self.status.get() == TaskStatus::Done {
            return 100.0;
        }
        let total = self.sleep_millis.load(Ordering::SeqCst);
        if total == 0 || self.started_at.lock().is_none() {
            return 0.0;
        }
        let slept = self.slept_millis.load(Ordering::SeqCst);
        (slept as f64 / total as f64 * 100.0).min(100.0)
    }

    fn task_result(&self) -> Value {
        json!({
            "sleep_millis": self.sleep_millis.load(Ordering::SeqCst),
            "slept_millis": self.slept_millis.load(Ordering::SeqCst),
        })
    }

    fn close(&self) {}
}
