//! Cloud egress for the fieldgate gateway.
//!
//! Samples flow `routing rules → per-connector buffer → flush worker →
//! connector`, with retry and circuit breaking around every delivery. Each
//! connector gets its own buffer and worker, so a slow or dead connector
//! never stalls its siblings. Delivery guarantees are likewise per
//! connector: a disk-persistent buffer gives at-least-once, a memory-only
//! buffer is best-effort, and no global exactly-once is pretended anywhere.

mod config;
mod connector;
mod events;
mod pipeline;
mod routing;
mod sample;

pub use config::ConnectorConfig;
pub use connector::CloudConnector;
pub use events::EgressEvent;
pub use pipeline::{ConnectorMetrics, EgressPipeline, EgressPipelineBuilder};
pub use routing::{RoutingRule, RoutingTable, SampleMatcher};
pub use sample::CloudSample;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldgate_core::{GatewayError, Quality, Value};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingState {
        received: Mutex<Vec<CloudSample>>,
        online: AtomicBool,
        fail_sends: AtomicUsize,
    }

    struct RecordingConnector {
        name: String,
        state: Arc<RecordingState>,
    }

    #[async_trait]
    impl CloudConnector for RecordingConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<(), GatewayError> {
            if self.state.online.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(GatewayError::Unreachable(self.name.clone()))
            }
        }

        async fn disconnect(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.state.online.load(Ordering::Acquire)
        }

        async fn send_data(&self, sample: &CloudSample) -> Result<(), GatewayError> {
            if self.state.fail_sends.load(Ordering::Acquire) > 0 {
                self.state.fail_sends.fetch_sub(1, Ordering::AcqRel);
                return Err(GatewayError::Transport("send failed".into()));
            }
            self.state.received.lock().push(sample.clone());
            Ok(())
        }

        async fn ping(&self) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn online_connector(name: &str) -> (Arc<RecordingConnector>, Arc<RecordingState>) {
        let state = Arc::new(RecordingState::default());
        state.online.store(true, Ordering::Release);
        (
            Arc::new(RecordingConnector {
                name: name.into(),
                state: Arc::clone(&state),
            }),
            state,
        )
    }

    fn sample(device: &str, tag: &str, v: u16) -> CloudSample {
        CloudSample::new(device, tag, Value::UInt16(v), Quality::Good)
    }

    fn fast_config(name: &str) -> ConnectorConfig {
        ConnectorConfig::new(name, "test", "mem://test")
            .flush_interval(Duration::from_millis(10))
            .retries(2, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn samples_reach_the_default_connector() {
        let (connector, state) = online_connector("primary");
        let pipeline = EgressPipeline::builder()
            .connector(connector, fast_config("primary"))
            .default_connector("primary")
            .build()
            .unwrap();

        pipeline.enqueue(sample("plc-1", "temp", 7)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = state.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].tag_id, "temp");
        drop(received);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn fan_out_rules_deliver_to_every_target() {
        let (a, state_a) = online_connector("lake");
        let (b, state_b) = online_connector("ops");
        let pipeline = EgressPipeline::builder()
            .connector(a, fast_config("lake"))
            .connector(b, fast_config("ops"))
            .rule(RoutingRule::fan_out(SampleMatcher::Any, "lake"))
            .rule(RoutingRule::exclusive(SampleMatcher::Any, "ops"))
            .build()
            .unwrap();

        pipeline.enqueue(sample("plc-1", "temp", 3)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(state_a.received.lock().len(), 1);
        assert_eq!(state_b.received.lock().len(), 1);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn transient_send_failures_are_retried() {
        let (connector, state) = online_connector("primary");
        state.fail_sends.store(2, Ordering::Release);
        let pipeline = EgressPipeline::builder()
            .connector(connector, fast_config("primary"))
            .default_connector("primary")
            .build()
            .unwrap();

        pipeline.enqueue(sample("plc-1", "temp", 9)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(state.received.lock().len(), 1);
        assert_eq!(pipeline.buffer_depth("primary"), Some(0));

        let metrics = pipeline.connector_metrics("primary").unwrap();
        assert_eq!(metrics.enqueued, 1);
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.buffered, 0);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn offline_connector_accumulates_then_drains() {
        let (connector, state) = online_connector("primary");
        state.online.store(false, Ordering::Release);
        let pipeline = EgressPipeline::builder()
            .connector(connector, fast_config("primary"))
            .default_connector("primary")
            .build()
            .unwrap();

        for i in 0..5 {
            pipeline.enqueue(sample("plc-1", "temp", i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pipeline.buffer_depth("primary"), Some(5));

        state.online.store(true, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.received.lock().len(), 5);
        assert_eq!(pipeline.buffer_depth("primary"), Some(0));
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn non_deduping_connectors_get_idempotency_tokens() {
        let (connector, state) = online_connector("primary");
        let pipeline = EgressPipeline::builder()
            .connector(connector, fast_config("primary"))
            .default_connector("primary")
            .build()
            .unwrap();

        let s = sample("plc-1", "temp", 1);
        let id = s.id;
        pipeline.enqueue(s).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = state.received.lock();
        assert_eq!(
            received[0].metadata.get("idempotency_token"),
            Some(&id.to_string())
        );
        drop(received);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn persistent_buffer_survives_a_pipeline_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            ConnectorConfig::new("primary", "test", "mem://test")
                .flush_interval(Duration::from_millis(10))
                .retries(0, Duration::from_millis(5))
                .disk_persistent(true)
        };

        // First life: connector offline, samples buffered to disk.
        {
            let (connector, state) = online_connector("primary");
            state.online.store(false, Ordering::Release);
            let pipeline = EgressPipeline::builder()
                .connector(connector, config())
                .default_connector("primary")
                .persistence_root(dir.path())
                .build()
                .unwrap();
            for i in 0..10 {
                pipeline.enqueue(sample("plc-1", "temp", i)).unwrap();
            }
            pipeline.shutdown(Duration::from_millis(200)).await;
        }

        // Second life: connector online, replayed samples drain.
        let (connector, state) = online_connector("primary");
        let pipeline = EgressPipeline::builder()
            .connector(connector, config())
            .default_connector("primary")
            .persistence_root(dir.path())
            .build()
            .unwrap();
        assert_eq!(pipeline.buffer_depth("primary"), Some(10));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let received = state.received.lock();
        assert_eq!(received.len(), 10);
        // Per-connector order is preserved.
        let values: Vec<_> = received
            .iter()
            .map(|s| match s.value {
                Value::UInt16(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        drop(received);
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_makes_a_final_delivery_attempt() {
        let (connector, state) = online_connector("primary");
        let pipeline = EgressPipeline::builder()
            .connector(
                connector,
                ConnectorConfig::new("primary", "test", "mem://test")
                    // Flush interval far in the future: only the shutdown
                    // drain can deliver.
                    .flush_interval(Duration::from_secs(3600)),
            )
            .default_connector("primary")
            .build()
            .unwrap();

        pipeline.enqueue(sample("plc-1", "temp", 2)).unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await;
        assert_eq!(state.received.lock().len(), 1);
    }
}
