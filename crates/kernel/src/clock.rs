//! The tempo clock — a logical tick loop driving periodic kernel work
//! (session TTL sweeps, fast-store expiry, liveness gauges).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

type TickCallback =
    Box<dyn Fn(u64) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct TempoClock {
    interval: Duration,
    tick: Arc<AtomicU64>,
    callbacks: Vec<TickCallback>,
}

impl TempoClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tick: Arc::new(AtomicU64::new(0)),
            callbacks: Vec::new(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Register an async callback invoked on every tick.
    pub fn on_tick<F, Fut>(&mut self, callback: F)
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks
            .push(Box::new(move |tick| Box::pin(callback(tick))));
    }

    /// Start the loop. Callbacks run sequentially within one tick; the loop
    /// stops when the handle is aborted or the runtime shuts down.
    pub fn start(self) -> ClockHandle {
        let tick = self.tick.clone();
        let tick_for_task = tick.clone();
        let interval = self.interval;
        let callbacks = self.callbacks;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let current = tick_for_task.fetch_add(1, Ordering::Relaxed) + 1;
                for callback in &callbacks {
                    callback(current).await;
                }
            }
        });
        tracing::info!(interval_ms = interval.as_millis() as u64, "tempo clock started");
        ClockHandle { tick, handle }
    }
}

pub struct ClockHandle {
    tick: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl ClockHandle {
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
