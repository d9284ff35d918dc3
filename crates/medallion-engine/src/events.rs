//! Event sinks for pipeline notifications.
//!
//! Emission is fire-and-forget: a sink never blocks or fails the stage
//! that produced the event.

use medallion_types::event::PipelineEvent;
use tokio::sync::mpsc;

/// Receiver of [`PipelineEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event {
            PipelineEvent::StageFailed { .. } => tracing::error!(
                event = event.name(),
                dataset = event.dataset().as_str(),
                payload = payload.as_str(),
                "Pipeline event"
            ),
            PipelineEvent::QualityBelowThreshold { .. } => tracing::warn!(
                event = event.name(),
                dataset = event.dataset().as_str(),
                payload = payload.as_str(),
                "Pipeline event"
            ),
            PipelineEvent::BatchCommitted { .. } | PipelineEvent::StageCompleted { .. } => {
                tracing::info!(
                    event = event.name(),
                    dataset = event.dataset().as_str(),
                    payload = payload.as_str(),
                    "Pipeline event"
                );
            }
        }
    }
}

/// Forwards events into a bounded channel. Events are dropped when the
/// channel is full or the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelEventSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a channel holding `capacity` events.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &PipelineEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(event = dropped.name(), "Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                tracing::warn!(
                    event = dropped.name(),
                    "Event channel closed, dropping event"
                );
            }
        }
    }
}

/// Fans each event out to several sinks.
#[derive(Default)]
pub struct MultiEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl MultiEventSink {
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiEventSink {
    fn emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
