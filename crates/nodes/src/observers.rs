//! Lifecycle observers.

use std::sync::{Arc, Mutex};

use pipeline::lifecycle::{LifecycleEvent, LifecycleObserver};
use tokio::sync::mpsc;

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::StageStarted { stage, name, iteration, .. } => {
                tracing::info!(stage = %stage, name = %name, iteration, "stage started")
            }
            LifecycleEvent::StageCompleted { stage, name, summary, cost, .. } => {
                tracing::info!(stage = %stage, name = %name, cost = %cost, "stage completed: {summary}")
            }
            LifecycleEvent::StageSkipped { stage, name, reason, .. } => {
                tracing::info!(stage = %stage, name = %name, "stage skipped: {reason}")
            }
            LifecycleEvent::RepairIteration { unit, iteration, .. } => {
                tracing::info!(unit = %unit, iteration, "repair round started")
            }
            LifecycleEvent::RepairExhausted { unit, iterations, .. } => {
                tracing::warn!(unit = %unit, iterations, "repair rounds exhausted; continuing with open issues")
            }
            LifecycleEvent::Paused { session, stage, .. } => {
                tracing::info!(session = %session, stage = %stage, "run paused for input")
            }
            LifecycleEvent::Completed { session, total_cost, .. } => {
                tracing::info!(session = %session, total_cost = %total_cost, "run completed")
            }
            LifecycleEvent::BudgetExceeded { session, accumulated, limit } => {
                tracing::warn!(session = %session, accumulated = %accumulated, limit = %limit, "cost budget exceeded")
            }
            LifecycleEvent::ConnectionFailed { reason } => {
                tracing::error!(reason = %reason, "tool connection failed; run not started")
            }
            LifecycleEvent::Error { reason, diagnostic, .. } => {
                tracing::error!(reason = %reason, "run failed: {diagnostic}")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drains the recorded events.
    pub fn take(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards events to an unbounded channel; dropped receivers are ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl LifecycleObserver for ChannelObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Fans events out to several observers.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn LifecycleObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.0.push(observer);
        self
    }
}

impl LifecycleObserver for Observers {
    fn on_event(&self, event: &LifecycleEvent) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_observer() {
        let recording = RecordingObserver::new();
        let (channel, mut rx) = ChannelObserver::new();
        let all = Observers::new()
            .with(Arc::new(recording.clone()))
            .with(Arc::new(channel))
            .with(Arc::new(TracingObserver));
        let event = LifecycleEvent::ConnectionFailed {
            reason: "refused".into(),
        };
        all.on_event(&event);
        assert_eq!(recording.events(), vec![event.clone()]);
        assert_eq!(rx.recv().await, Some(event));
        assert!(recording.take().len() == 1 && recording.events().is_empty());
    }
}
