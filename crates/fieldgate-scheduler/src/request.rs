//! Batch requests and their completion sinks.

use fieldgate_core::{DataType, DeviceId, GatewayError, Tag, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// What a request asks of the device.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Read,
    Write(Value),
}

/// Operation kind, part of the batch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

impl BatchOp {
    pub fn kind(&self) -> OpKind {
        match self {
            BatchOp::Read => OpKind::Read,
            BatchOp::Write(_) => OpKind::Write,
        }
    }
}

/// One submitted tag operation.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub tag: Tag,
    pub op: BatchOp,
    /// 0..=9; above the configured threshold the request forces an early
    /// flush and sits at the head of its batch.
    pub priority: u8,
    pub deadline: Option<Instant>,
    /// `false` pins the request into a batch of its own.
    pub can_batch: bool,
    /// The handler's opaque adjacency-class token for the tag's address.
    pub batch_class: u64,
}

impl BatchRequest {
    pub fn read(device_id: impl Into<DeviceId>, tag: Tag, batch_class: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            tag,
            op: BatchOp::Read,
            priority: 5,
            deadline: None,
            can_batch: true,
            batch_class,
        }
    }

    pub fn write(
        device_id: impl Into<DeviceId>,
        tag: Tag,
        value: Value,
        batch_class: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            tag,
            op: BatchOp::Write(value),
            priority: 5,
            deadline: None,
            can_batch: true,
            batch_class,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn unbatched(mut self) -> Self {
        self.can_batch = false;
        self
    }

    pub(crate) fn data_type(&self) -> DataType {
        self.tag.data_type
    }
}

/// The outcome delivered to a request's completion sink.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// The read value; `None` for write acknowledgements.
    pub value: Option<Value>,
    /// Wire latency of the batch that carried this request.
    pub latency: Duration,
}

/// Receives the single completion of a submitted request.
pub type CompletionReceiver = oneshot::Receiver<Result<BatchResult, GatewayError>>;

/// The sending half; fires exactly once.
///
/// If a sink is dropped without an explicit completion (a bug or a
/// force-aborted dispatch), `Shutdown` is delivered so the submitter never
/// waits forever.
pub(crate) struct CompletionSink {
    tx: Option<oneshot::Sender<Result<BatchResult, GatewayError>>>,
}

impl CompletionSink {
    pub fn channel() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn complete(mut self, result: Result<BatchResult, GatewayError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(GatewayError::Shutdown));
        }
    }
}
