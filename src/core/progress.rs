//! Transfer progress: an ordered event stream plus per-stage counters.
//!
//! The counters are only mutated by the pipeline through [`ProgressReporter`];
//! callers get a read-only [`ProgressHandle`]. Every event carries a snapshot
//! of the counters taken right after the change that caused it. Snapshots are
//! shared behind an `Arc`, so every subscriber holding the same event points
//! at the same copy.
//!
//! Events fan out over a `broadcast` channel that keeps at most the last
//! `capacity` events (rounded up to a power of two). The transfer never waits
//! for subscribers. A subscriber that falls further behind than that skips
//! the oldest events and carries on from the oldest one still kept; the
//! number skipped is reported by [`ProgressSubscription::missed`]. The latest
//! counters are always available from [`ProgressHandle::data`]. Once the
//! transfer settles the stream closes and `recv()` returns `None` after the
//! kept events are drained.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::stages::TransferStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Aggregate {
    pub count: u64,
    pub bytes: u64,
}

/// Counters for one data stage. Never decrease within a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StageProgress {
    pub count: u64,
    pub bytes: u64,
    pub aggregates: BTreeMap<String, Aggregate>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of every started data stage's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ProgressSnapshot {
    stages: BTreeMap<TransferStage, StageProgress>,
}

impl ProgressSnapshot {
    pub fn get(&self, stage: TransferStage) -> Option<&StageProgress> {
        self.stages.get(&stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TransferStage, &StageProgress)> {
        self.stages.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Items moved across all stages.
    pub fn total_count(&self) -> u64 {
        self.stages.values().map(|s| s.count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProgressEventKind {
    #[serde(rename = "transfer::start")]
    TransferStart,
    #[serde(rename = "transfer::finish")]
    TransferFinish,
    #[serde(rename = "transfer::error")]
    TransferError,
    #[serde(rename = "stage::start")]
    StageStart,
    #[serde(rename = "stage::finish")]
    StageFinish,
    #[serde(rename = "stage::skip")]
    StageSkip,
    #[serde(rename = "stage::progress")]
    StageProgress,
}

impl ProgressEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransferStart => "transfer::start",
            Self::TransferFinish => "transfer::finish",
            Self::TransferError => "transfer::error",
            Self::StageStart => "stage::start",
            Self::StageFinish => "stage::finish",
            Self::StageSkip => "stage::skip",
            Self::StageProgress => "stage::progress",
        }
    }
}

impl fmt::Display for ProgressEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    /// `None` for transfer-level events.
    pub stage: Option<TransferStage>,
    pub data: Arc<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Subscribable event channel. Subscribers attach and detach (by dropping
/// their [`ProgressSubscription`]) at any time.
#[derive(Clone)]
pub struct ProgressStream {
    sender: Arc<Mutex<Option<broadcast::Sender<ProgressEvent>>>>,
}

impl ProgressStream {
    fn new(capacity: usize) -> Self {
        // broadcast::channel panics on zero.
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = match sender.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        ProgressSubscription { rx, missed: 0 }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn emit(&self, event: ProgressEvent) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sender.as_ref() {
            // Fails only when nobody is subscribed.
            let _ = tx.send(event);
        }
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Receiving end of one subscription.
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
    missed: u64,
}

impl ProgressSubscription {
    /// Next event, or `None` once the transfer has settled and every
    /// kept event was received. Skips over events lost to lagging.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.missed += skipped,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Take every event kept so far without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events dropped because this subscriber fell too far behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Read-only view of a transfer's progress.
#[derive(Clone)]
pub struct ProgressHandle {
    stream: ProgressStream,
    data: Arc<RwLock<Arc<ProgressSnapshot>>>,
}

impl ProgressHandle {
    pub fn stream(&self) -> &ProgressStream {
        &self.stream
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.stream.subscribe()
    }

    /// Current counters. Still readable after the transfer settled.
    pub async fn data(&self) -> ProgressSnapshot {
        self.data.read().await.as_ref().clone()
    }

    pub async fn stage(&self, stage: TransferStage) -> Option<StageProgress> {
        self.data.read().await.get(stage).cloned()
    }
}

/// Write side of the progress handle, owned by the engine.
pub(crate) struct ProgressReporter {
    handle: ProgressHandle,
}

impl ProgressReporter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            handle: ProgressHandle {
                stream: ProgressStream::new(capacity),
                data: Arc::default(),
            },
        }
    }

    pub(crate) fn handle(&self) -> &ProgressHandle {
        &self.handle
    }

    async fn emit(
        &self,
        kind: ProgressEventKind,
        stage: Option<TransferStage>,
        error: Option<String>,
    ) {
        let data = Arc::clone(&*self.handle.data.read().await);
        self.handle.stream.emit(ProgressEvent {
            kind,
            stage,
            data,
            error,
        });
    }

    /// Apply `update` to the counters. Copies the snapshot only while an
    /// earlier event still holds it.
    async fn update(&self, apply: impl FnOnce(&mut ProgressSnapshot)) {
        let mut data = self.handle.data.write().await;
        apply(Arc::make_mut(&mut *data));
    }

    pub(crate) async fn transfer_started(&self) {
        self.emit(ProgressEventKind::TransferStart, None, None).await;
    }

    pub(crate) async fn transfer_finished(&self) {
        self.emit(ProgressEventKind::TransferFinish, None, None).await;
        self.handle.stream.close();
    }

    pub(crate) async fn transfer_failed(&self, error: &impl fmt::Display) {
        self.emit(
            ProgressEventKind::TransferError,
            None,
            Some(error.to_string()),
        )
        .await;
        self.handle.stream.close();
    }

    /// Close the stream without a terminal event (the run never started).
    pub(crate) fn abandon(&self) {
        self.handle.stream.close();
    }

    pub(crate) async fn stage_started(&self, stage: TransferStage) {
        if stage.is_data_stage() {
            self.update(|data| {
                data.stages.entry(stage).or_default().started_at = Some(Utc::now());
            })
            .await;
        }
        self.emit(ProgressEventKind::StageStart, Some(stage), None)
            .await;
    }

    pub(crate) async fn stage_skipped(&self, stage: TransferStage) {
        self.emit(ProgressEventKind::StageSkip, Some(stage), None)
            .await;
    }

    pub(crate) async fn stage_finished(&self, stage: TransferStage) {
        if stage.is_data_stage() {
            self.update(|data| {
                data.stages.entry(stage).or_default().finished_at = Some(Utc::now());
            })
            .await;
        }
        self.emit(ProgressEventKind::StageFinish, Some(stage), None)
            .await;
    }

    /// Count one item that crossed the stage's pipe.
    pub(crate) async fn item_transferred(
        &self,
        stage: TransferStage,
        bytes: u64,
        key: Option<&str>,
    ) {
        self.update(|data| {
            let progress = data.stages.entry(stage).or_default();
            progress.count += 1;
            progress.bytes += bytes;
            if let Some(key) = key {
                let aggregate = progress.aggregates.entry(key.to_string()).or_default();
                aggregate.count += 1;
                aggregate.bytes += bytes;
            }
        })
        .await;
        self.emit(ProgressEventKind::StageProgress, Some(stage), None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate_per_stage() {
        let reporter = ProgressReporter::new(16);
        let handle = reporter.handle().clone();

        assert!(handle.data().await.is_empty());

        reporter.stage_started(TransferStage::Entities).await;
        reporter
            .item_transferred(TransferStage::Entities, 10, Some("foo"))
            .await;
        reporter
            .item_transferred(TransferStage::Entities, 5, Some("bar"))
            .await;
        reporter
            .item_transferred(TransferStage::Entities, 7, Some("foo"))
            .await;
        reporter.stage_finished(TransferStage::Entities).await;

        let entities = handle.stage(TransferStage::Entities).await.unwrap();
        assert_eq!(entities.count, 3);
        assert_eq!(entities.bytes, 22);
        assert_eq!(entities.aggregates["foo"], Aggregate { count: 2, bytes: 17 });
        assert_eq!(entities.aggregates["bar"], Aggregate { count: 1, bytes: 5 });
        assert!(entities.started_at.is_some());
        assert!(entities.finished_at.is_some());
        assert!(handle.stage(TransferStage::Links).await.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_stages_have_no_counters() {
        let reporter = ProgressReporter::new(16);
        reporter.stage_started(TransferStage::Bootstrap).await;
        reporter.stage_finished(TransferStage::Bootstrap).await;

        assert!(reporter.handle().data().await.is_empty());
    }

    #[tokio::test]
    async fn test_events_carry_snapshot_in_order() {
        let reporter = ProgressReporter::new(16);
        let mut sub = reporter.handle().subscribe();

        reporter.transfer_started().await;
        reporter.stage_started(TransferStage::Links).await;
        reporter
            .item_transferred(TransferStage::Links, 3, None)
            .await;
        reporter.stage_finished(TransferStage::Links).await;
        reporter.stage_skipped(TransferStage::Assets).await;
        reporter.transfer_finished().await;

        let events = sub.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            [
                "transfer::start",
                "stage::start",
                "stage::progress",
                "stage::finish",
                "stage::skip",
                "transfer::finish"
            ]
        );

        assert_eq!(events[2].stage, Some(TransferStage::Links));
        assert_eq!(events[2].data.get(TransferStage::Links).unwrap().count, 1);
        assert!(events[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_stream_closes_after_terminal_event() {
        let reporter = ProgressReporter::new(16);
        let mut sub = reporter.handle().subscribe();

        reporter.transfer_started().await;
        reporter.transfer_failed(&"boom").await;

        assert_eq!(
            sub.recv().await.map(|e| e.kind),
            Some(ProgressEventKind::TransferStart)
        );
        let failed = sub.recv().await.unwrap();
        assert_eq!(failed.kind, ProgressEventKind::TransferError);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(sub.recv().await.is_none());

        let mut late = reporter.handle().subscribe();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_detached() {
        let reporter = ProgressReporter::new(16);
        let stream = reporter.handle().stream().clone();

        let first = stream.subscribe();
        let mut second = stream.subscribe();
        assert_eq!(stream.subscriber_count(), 2);

        drop(first);
        reporter.transfer_started().await;

        assert_eq!(stream.subscriber_count(), 1);
        assert_eq!(second.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_subscriber_keeps_only_the_latest_events() {
        let reporter = ProgressReporter::new(4);
        let mut idle = reporter.handle().subscribe();
        let mut other = reporter.handle().subscribe();

        reporter.stage_started(TransferStage::Entities).await;
        for i in 0..100 {
            let key = format!("type-{}", i % 10);
            reporter
                .item_transferred(TransferStage::Entities, 1, Some(&key))
                .await;
        }
        reporter.transfer_finished().await;

        let events = idle.drain();
        assert_eq!(events.len(), 4);
        assert_eq!(idle.missed() + events.len() as u64, 102);

        let last = events.last().unwrap();
        assert_eq!(last.kind, ProgressEventKind::TransferFinish);
        let entities = last.data.get(TransferStage::Entities).unwrap();
        assert_eq!(entities.count, 100);
        assert_eq!(entities.aggregates.len(), 10);

        // Subscribers share one snapshot per event.
        let other_last = other.drain().pop().unwrap();
        assert!(Arc::ptr_eq(&last.data, &other_last.data));
        assert!(idle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unobserved_events_are_not_retained() {
        let reporter = ProgressReporter::new(16);
        reporter.stage_started(TransferStage::Links).await;
        reporter.item_transferred(TransferStage::Links, 1, None).await;

        let shared = Arc::clone(&*reporter.handle().data.read().await);
        // The handle's copy plus this one; no event kept a reference.
        assert_eq!(Arc::strong_count(&shared), 2);
    }

    #[test]
    fn test_event_kind_serializes_with_namespaced_name() {
        let json = serde_json::to_string(&ProgressEventKind::StageProgress).unwrap();
        assert_eq!(json, "\"stage::progress\"");
    }
}
