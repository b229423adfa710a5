//! Background loops sharing one shutdown signal.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

pub struct TaskGroup {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `tick` every `period` until shutdown. Each tick runs as its own
    /// task, so a panicking tick is logged and the loop keeps going. Must be
    /// called inside a tokio runtime.
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let group = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(group, task, ?period, "loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tokio::spawn(tick()).await {
                            error!(group, task, error = %e, "tick failed, loop continues");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(group, task, "loop exited");
        });
        self.handles.lock().push(handle);
    }

    pub fn running(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every loop and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(group = self.name, error = %e, "background task failed");
            }
        }
    }
}
