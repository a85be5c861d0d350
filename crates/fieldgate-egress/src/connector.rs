//! The cloud connector contract.

use crate::sample::CloudSample;
use async_trait::async_trait;
use fieldgate_core::GatewayError;

/// A cloud-side egress endpoint.
///
/// Send operations should be idempotent at sample-id granularity where the
/// underlying channel allows it. A connector that cannot deduplicate
/// declares so via [`dedups`](CloudConnector::dedups); the pipeline then
/// attaches an idempotency token to each sample's metadata so the far side
/// may deduplicate instead.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    /// Unique connector name; routing rules refer to it.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), GatewayError>;

    /// Idempotent close.
    async fn disconnect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Delivers one sample.
    async fn send_data(&self, sample: &CloudSample) -> Result<(), GatewayError>;

    /// Delivers a batch; the default loops [`send_data`](Self::send_data).
    /// Order within one call is the buffer's FIFO order.
    async fn send_batch(&self, samples: &[CloudSample]) -> Result<(), GatewayError> {
        for sample in samples {
            self.send_data(sample).await?;
        }
        Ok(())
    }

    /// Cheap liveness probe of the egress channel.
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Whether the channel deduplicates by sample id on its own.
    fn dedups(&self) -> bool {
        false
    }
}
