use async_trait::async_trait;
use cortex_common::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Layer {
    MemorySpace,
    User,
    Agent,
    Conversation,
    Vector,
    Facts,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    Pending,
    Complete,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerEvent {
    pub orchestration_id: String,
    pub layer: Layer,
    pub status: LayerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationSummary {
    pub orchestration_id: String,
    pub total_latency_ms: u64,
    pub created_ids: BTreeMap<String, Vec<String>>,
}

/// Layer-event hooks. All callbacks default to no-ops; implementations may
/// fail, and failures are logged and swallowed, so observers can never break
/// an orchestration.
#[async_trait]
pub trait OrchestrationObserver: Send + Sync {
    async fn on_orchestration_start(&self, _orchestration_id: &str) -> Result<()> {
        Ok(())
    }

    async fn on_layer_update(&self, _event: &LayerEvent) -> Result<()> {
        Ok(())
    }

    async fn on_orchestration_complete(&self, _summary: &OrchestrationSummary) -> Result<()> {
        Ok(())
    }
}

/// Dispatch wrapper the orchestrators emit through.
#[derive(Clone, Default)]
pub struct ObserverHub {
    observer: Option<Arc<dyn OrchestrationObserver>>,
}

impl ObserverHub {
    pub fn new(observer: Option<Arc<dyn OrchestrationObserver>>) -> Self {
        Self { observer }
    }

    pub async fn orchestration_start(&self, orchestration_id: &str) {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_orchestration_start(orchestration_id).await {
                tracing::warn!("observer on_orchestration_start failed: {e}");
            }
        }
    }

    pub async fn layer(&self, event: LayerEvent) {
        tracing::debug!(
            orchestration = %event.orchestration_id,
            layer = ?event.layer,
            status = ?event.status,
            "layer event"
        );
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_layer_update(&event).await {
                tracing::warn!("observer on_layer_update failed: {e}");
            }
        }
    }

    pub async fn orchestration_complete(&self, summary: OrchestrationSummary) {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_orchestration_complete(&summary).await {
                tracing::warn!("observer on_orchestration_complete failed: {e}");
            }
        }
    }
}

/// Observer that records every event; handy in tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<LayerEvent>>,
    pub started: std::sync::Mutex<Vec<String>>,
    pub completed: std::sync::Mutex<Vec<OrchestrationSummary>>,
}

#[async_trait]
impl OrchestrationObserver for RecordingObserver {
    async fn on_orchestration_start(&self, orchestration_id: &str) -> Result<()> {
        self.started
            .lock()
            .expect("observer lock")
            .push(orchestration_id.to_string());
        Ok(())
    }

    async fn on_layer_update(&self, event: &LayerEvent) -> Result<()> {
        self.events.lock().expect("observer lock").push(event.clone());
        Ok(())
    }

    async fn on_orchestration_complete(&self, summary: &OrchestrationSummary) -> Result<()> {
        self.completed
            .lock()
            .expect("observer lock")
            .push(summary.clone());
        Ok(())
    }
}

impl RecordingObserver {
    /// Every `pending` event must be matched by exactly one terminal event
    /// for the same layer within the same orchestration.
    pub fn assert_pending_terminated(&self) {
        let events = self.events.lock().expect("observer lock");
        for (i, event) in events.iter().enumerate() {
            if event.status != LayerStatus::Pending {
                continue;
            }
            let terminals = events
                .iter()
                .skip(i + 1)
                .filter(|e| {
                    e.orchestration_id == event.orchestration_id
                        && e.layer == event.layer
                        && e.status != LayerStatus::Pending
                })
                .count();
            assert_eq!(
                terminals, 1,
                "layer {:?} in {} has {} terminal events",
                event.layer, event.orchestration_id, terminals
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::CortexError;

    struct FailingObserver;

    #[async_trait]
    impl OrchestrationObserver for FailingObserver {
        async fn on_layer_update(&self, _event: &LayerEvent) -> Result<()> {
            Err(CortexError::transport("observer exploded"))
        }
    }

    #[tokio::test]
    async fn test_observer_errors_are_swallowed() {
        let hub = ObserverHub::new(Some(Arc::new(FailingObserver)));
        // Must not panic or propagate.
        hub.layer(LayerEvent {
            orchestration_id: "o1".into(),
            layer: Layer::Vector,
            status: LayerStatus::Error,
            detail: Some("boom".into()),
            created_ids: Vec::new(),
        })
        .await;
    }

    #[tokio::test]
    async fn test_recording_observer_orders_events() {
        let recording = Arc::new(RecordingObserver::default());
        let hub = ObserverHub::new(Some(recording.clone()));

        hub.orchestration_start("o1").await;
        hub.layer(LayerEvent {
            orchestration_id: "o1".into(),
            layer: Layer::Conversation,
            status: LayerStatus::Pending,
            detail: None,
            created_ids: Vec::new(),
        })
        .await;
        hub.layer(LayerEvent {
            orchestration_id: "o1".into(),
            layer: Layer::Conversation,
            status: LayerStatus::Complete,
            detail: None,
            created_ids: vec!["m1".into()],
        })
        .await;

        recording.assert_pending_terminated();
        assert_eq!(recording.started.lock().unwrap().len(), 1);
    }
}
