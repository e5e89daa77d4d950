use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::core::error::EngineError;

/// Wall clock plus sleep. The engine never reads time or sleeps any other way.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Virtual time. `sleep` advances the clock instantly and records the
/// duration, so a whole release window plays out in microseconds.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, d: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(d);
        self.advance(d);
        tokio::task::yield_now().await;
    }
}

/// Cooperative sleeper: every pause races the clock against the operator's
/// abort switch.
#[derive(Clone)]
pub struct Pacer {
    clock: Arc<dyn Clock>,
    abort_rx: watch::Receiver<bool>,
}

impl Pacer {
    pub fn new(clock: Arc<dyn Clock>, abort_rx: watch::Receiver<bool>) -> Self {
        Self { clock, abort_rx }
    }

    /// A pacer nobody can abort.
    pub fn unattended(clock: Arc<dyn Clock>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(clock, rx)
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if *self.abort_rx.borrow() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub async fn pause(&self, d: Duration) -> Result<(), EngineError> {
        self.check()?;
        if d.is_zero() {
            return Ok(());
        }
        let mut rx = self.abort_rx.clone();
        tokio::select! {
            _ = self.clock.sleep(d) => Ok(()),
            _ = wait_for_abort(&mut rx) => Err(EngineError::Cancelled),
        }
    }
}

/// Resolves once the abort flag is set. A dropped sender means nobody can
/// abort any more, so this never resolves.
async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
