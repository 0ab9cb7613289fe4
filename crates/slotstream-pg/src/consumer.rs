//! The consumption loop.
//!
//! Waits for stream data, hands each change to a sink, and reports the
//! highest position seen back to the server so it can recycle WAL. Feedback is
//! only ever sent for data already received, and never moves backwards.

use std::time::Duration;

use serde::Deserialize;
use slotstream_core::{ChangeSink, Durability, FeedbackState, Lsn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PgError, PgResult};
use crate::replication::{
    PrimaryKeepalive, ReplicationMessage, ReplicationTransport, StandbyStatus, StartReplication,
    XLogData,
};

/// When the flushed position may advance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackPolicy {
    /// Flushed advances only once the sink reports the record persisted.
    #[default]
    Durable,
    /// Applied and flushed both advance as soon as the sink accepts a record.
    OnReceipt,
}

/// What to do with a frame that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    #[default]
    Abort,
    /// Log and move on to the next frame.
    Skip,
}

/// How the loop waits for data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Suspend until the socket has data.
    #[default]
    Readiness,
    /// Poll without blocking, sleeping `interval` whenever nothing is pending.
    Poll { interval: Duration },
}

impl WaitStrategy {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn poll() -> Self {
        WaitStrategy::Poll {
            interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How often the current feedback is sent even without new data.
    pub status_interval: Duration,
    /// Output plugin options, e.g. `include-xids = true` for wal2json.
    pub plugin_options: Vec<(String, String)>,
    pub wait: WaitStrategy,
    pub feedback: FeedbackPolicy,
    pub decode: DecodePolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(10),
            plugin_options: Vec::new(),
            wait: WaitStrategy::default(),
            feedback: FeedbackPolicy::default(),
            decode: DecodePolicy::default(),
        }
    }
}

/// Why the loop returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// The server ended the copy stream.
    StreamEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub stop: StopReason,
    pub records: u64,
    pub skipped: u64,
    pub keepalives: u64,
    pub statuses_sent: u64,
    pub last_received: Lsn,
    pub feedback: FeedbackState,
}

enum Event {
    Cancelled,
    StatusDue,
    Message(PgResult<ReplicationMessage>),
}

/// Consumes a logical stream over a [`ReplicationTransport`].
pub struct StreamConsumer<'a, T> {
    transport: &'a mut T,
    options: ConsumerOptions,
    feedback: FeedbackState,
    last_received: Lsn,
    last_sent: Option<StandbyStatus>,
    records: u64,
    skipped: u64,
    keepalives: u64,
    statuses_sent: u64,
}

impl<'a, T: ReplicationTransport> StreamConsumer<'a, T> {
    pub fn new(transport: &'a mut T, options: ConsumerOptions) -> Self {
        Self {
            transport,
            options,
            feedback: FeedbackState::new(),
            last_received: Lsn::INVALID,
            last_sent: None,
            records: 0,
            skipped: 0,
            keepalives: 0,
            statuses_sent: 0,
        }
    }

    /// Positions reported so far.
    pub fn feedback(&self) -> FeedbackState {
        self.feedback
    }

    pub fn last_received(&self) -> Lsn {
        self.last_received
    }

    /// Stream `slot` from `start`, delivering every change to `sink`.
    ///
    /// Runs until `cancel` fires, the server ends the stream, or a fatal error
    /// occurs. On cancellation the latest feedback is sent before returning.
    pub async fn consume<S: ChangeSink>(
        &mut self,
        slot: &str,
        start: Lsn,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> PgResult<ConsumeSummary> {
        let mut request = StartReplication::new(slot, start);
        for (key, value) in &self.options.plugin_options {
            request = request.option(key.as_str(), value.as_str());
        }
        self.transport.start_logical(&request).await?;

        let period = self.options.status_interval;
        let mut status_timer = interval_at(Instant::now() + period, period);
        status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = match self.options.wait {
                WaitStrategy::Readiness => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Event::Cancelled,
                        _ = status_timer.tick() => Event::StatusDue,
                        message = self.transport.recv() => Event::Message(message),
                    }
                }
                WaitStrategy::Poll { interval } => {
                    if cancel.is_cancelled() {
                        Event::Cancelled
                    } else {
                        match self.transport.try_recv() {
                            Ok(Some(message)) => Event::Message(Ok(message)),
                            Err(e) => Event::Message(Err(e)),
                            Ok(None) => {
                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => Event::Cancelled,
                                    _ = status_timer.tick() => Event::StatusDue,
                                    _ = tokio::time::sleep(interval) => continue,
                                }
                            }
                        }
                    }
                }
            };

            match event {
                Event::Cancelled => {
                    info!(lsn = %self.last_received, "Consumer cancelled, flushing feedback");
                    self.send_status().await?;
                    return Ok(self.summary(StopReason::Cancelled));
                }
                Event::StatusDue => self.send_status().await?,
                Event::Message(Ok(ReplicationMessage::XLogData(data))) => {
                    self.on_data(data, sink).await?;
                }
                Event::Message(Ok(ReplicationMessage::PrimaryKeepalive(keepalive))) => {
                    self.on_keepalive(keepalive).await?;
                }
                Event::Message(Err(PgError::StreamClosed)) => {
                    info!(lsn = %self.last_received, "Replication stream ended by server");
                    return Ok(self.summary(StopReason::StreamEnded));
                }
                Event::Message(Err(e))
                    if e.is_decode() && self.options.decode == DecodePolicy::Skip =>
                {
                    self.skipped += 1;
                    warn!(error = %e, skipped = self.skipped, "Skipping undecodable frame");
                }
                Event::Message(Err(e)) => return Err(e),
            }
        }
    }

    async fn on_data<S: ChangeSink>(&mut self, data: XLogData, sink: &mut S) -> PgResult<()> {
        let lsn = data.wal_start;
        if lsn > self.last_received {
            self.last_received = lsn;
        }

        // Frames were length-checked in `ReplicationMessage::decode`.
        let record = data.into_record()?;

        debug!(lsn = %lsn, bytes = record.data.len(), "Received change");
        let durability = sink.deliver(record).await?;
        self.records += 1;

        match self.options.feedback {
            FeedbackPolicy::OnReceipt => {
                self.feedback.advance(lsn);
            }
            FeedbackPolicy::Durable => {
                self.feedback.advance_applied(lsn);
                if durability == Durability::Persisted {
                    self.feedback.advance_flushed(lsn);
                }
            }
        }

        self.send_status().await
    }

    async fn on_keepalive(&mut self, keepalive: PrimaryKeepalive) -> PgResult<()> {
        self.keepalives += 1;
        debug!(
            wal_end = %keepalive.wal_end,
            reply = keepalive.reply_requested,
            "Keepalive"
        );

        if keepalive.reply_requested {
            self.send_status().await?;
        }
        Ok(())
    }

    async fn send_status(&mut self) -> PgResult<()> {
        let mut status = StandbyStatus::new(
            self.last_received.max(self.feedback.applied),
            self.feedback.flushed,
            self.feedback.applied,
        );

        // Never report less than what the server has already been told.
        if let Some(last) = self.last_sent {
            status.written = status.written.max(last.written);
            status.flushed = status.flushed.max(last.flushed);
            status.applied = status.applied.max(last.applied);
        }

        self.transport.send_status(status).await?;
        self.last_sent = Some(status);
        self.statuses_sent += 1;
        Ok(())
    }

    fn summary(&self, stop: StopReason) -> ConsumeSummary {
        ConsumeSummary {
            stop,
            records: self.records,
            skipped: self.skipped,
            keepalives: self.keepalives,
            statuses_sent: self.statuses_sent,
            last_received: self.last_received,
            feedback: self.feedback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::MockTransport;
    use slotstream_core::MemorySink;

    fn lsn(value: u64) -> Lsn {
        Lsn::new(value)
    }

    fn assert_non_decreasing(statuses: &[StandbyStatus]) {
        for pair in statuses.windows(2) {
            assert!(pair[1].written >= pair[0].written, "{:?}", pair);
            assert!(pair[1].flushed >= pair[0].flushed, "{:?}", pair);
            assert!(pair[1].applied >= pair[0].applied, "{:?}", pair);
        }
    }

    #[tokio::test]
    async fn test_three_frames_end_to_end() {
        let mut transport = MockTransport::new();
        transport
            .push_data(lsn(0x100), b"{\"change\":[1]}")
            .push_data(lsn(0x200), b"{\"change\":[2]}")
            .push_data(lsn(0x300), b"{\"change\":[3]}");
        let recorder = transport.clone();

        let options = ConsumerOptions {
            plugin_options: vec![("include-xids".into(), "true".into())],
            ..Default::default()
        };
        let mut sink = MemorySink::new();
        let cancel = CancellationToken::new();

        let mut consumer = StreamConsumer::new(&mut transport, options);
        let summary = consumer
            .consume("slot", lsn(0x80), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::StreamEnded);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.feedback.applied, lsn(0x300));
        assert_eq!(summary.feedback.flushed, lsn(0x300));

        let records = sink.records();
        let positions: Vec<Lsn> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(positions, vec![lsn(0x100), lsn(0x200), lsn(0x300)]);
        assert_eq!(records[2].as_text().unwrap(), "{\"change\":[3]}");

        let started = recorder.started().unwrap();
        assert_eq!(started.slot, "slot");
        assert_eq!(started.start, lsn(0x80));
        assert_eq!(
            started.options,
            vec![("include-xids".to_string(), "true".to_string())]
        );

        // One status per record, sent right after it.
        let statuses = recorder.statuses();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].flushed, lsn(0x100));
        assert_eq!(statuses[2].flushed, lsn(0x300));
        assert_eq!(statuses[2].applied, lsn(0x300));
    }

    #[tokio::test]
    async fn test_feedback_never_decreases() {
        let mut transport = MockTransport::new();
        transport
            .push_data(lsn(0x300), b"c")
            .push_data(lsn(0x100), b"a")
            .push_keepalive(lsn(0x350), true)
            .push_data(lsn(0x200), b"b")
            .push_data(lsn(0x400), b"d");
        let recorder = transport.clone();

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        let statuses = recorder.statuses();
        assert_non_decreasing(&statuses);
        assert_eq!(statuses[1].flushed, lsn(0x300));
        assert_eq!(summary.feedback.flushed, lsn(0x400));
        assert_eq!(consumer.feedback().applied, lsn(0x400));
        assert_eq!(sink.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_last_feedback() {
        let mut transport = MockTransport::new().hold_open();
        transport
            .push_data(lsn(0x100), b"a")
            .push_data(lsn(0x200), b"b");
        let recorder = transport.clone();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.records, 2);

        // Two per-record statuses, periodic ones at 10s and 20s, and the final flush.
        let statuses = recorder.statuses();
        assert_eq!(statuses.len() as u64, summary.statuses_sent);
        assert!(statuses.len() >= 4, "{} statuses", statuses.len());
        assert_non_decreasing(&statuses);

        let last = recorder.last_status().unwrap();
        assert_eq!(last.flushed, lsn(0x200));
        assert_eq!(last.applied, lsn(0x200));
    }

    #[tokio::test]
    async fn test_cancel_before_data_sends_invalid_position() {
        let mut transport = MockTransport::new().hold_open();
        let recorder = transport.clone();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert!(summary.feedback.is_empty());
        assert_eq!(recorder.last_status().unwrap().flushed, Lsn::INVALID);
    }

    #[tokio::test]
    async fn test_keepalive_reply() {
        let mut transport = MockTransport::new();
        transport
            .push_keepalive(lsn(0x10), false)
            .push_keepalive(lsn(0x20), true);
        let recorder = transport.clone();

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keepalives, 2);
        assert_eq!(recorder.statuses().len(), 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_decode_skip() {
        let mut transport = MockTransport::new();
        transport
            .push_data(lsn(0x100), b"a")
            .push_malformed(b"w\x00\x00")
            .push_malformed(b"?")
            .push_data(lsn(0x200), b"b");

        let options = ConsumerOptions {
            decode: DecodePolicy::Skip,
            ..Default::default()
        };
        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, options);
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.feedback.flushed, lsn(0x200));
    }

    #[tokio::test]
    async fn test_decode_abort() {
        let mut transport = MockTransport::new();
        transport
            .push_data(lsn(0x100), b"a")
            .push_malformed(b"k\x00")
            .push_data(lsn(0x200), b"b");

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let err = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(sink.len(), 1);
        assert_eq!(consumer.feedback().flushed, lsn(0x100));
    }

    #[tokio::test]
    async fn test_durable_feedback_waits_for_persistence() {
        let mut transport = MockTransport::new();
        transport
            .push_data(lsn(0x100), b"a")
            .push_data(lsn(0x200), b"b");
        let recorder = transport.clone();

        let mut sink = MemorySink::with_durability(Durability::Received);
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.feedback.applied, lsn(0x200));
        assert_eq!(summary.feedback.flushed, Lsn::INVALID);

        let last = recorder.last_status().unwrap();
        assert_eq!(last.written, lsn(0x200));
        assert_eq!(last.flushed, Lsn::INVALID);
    }

    #[tokio::test]
    async fn test_on_receipt_feedback() {
        let mut transport = MockTransport::new();
        transport.push_data(lsn(0x100), b"a");

        let options = ConsumerOptions {
            feedback: FeedbackPolicy::OnReceipt,
            ..Default::default()
        };
        let mut sink = MemorySink::with_durability(Durability::Received);
        let mut consumer = StreamConsumer::new(&mut transport, options);
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.feedback.flushed, lsn(0x100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode() {
        let mut transport = MockTransport::new();
        transport
            .push_gap()
            .push_data(lsn(0x100), b"a")
            .push_gap()
            .push_gap()
            .push_data(lsn(0x200), b"b");

        let options = ConsumerOptions {
            wait: WaitStrategy::poll(),
            ..Default::default()
        };
        let mut sink = MemorySink::new();
        let started = Instant::now();
        let mut consumer = StreamConsumer::new(&mut transport, options);
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.stop, StopReason::StreamEnded);
        // Each empty poll sleeps once.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode_status_timer_and_cancel() {
        let mut transport = MockTransport::new().hold_open();
        transport.push_data(lsn(0x100), b"a");
        let recorder = transport.clone();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let options = ConsumerOptions {
            wait: WaitStrategy::poll(),
            ..Default::default()
        };
        let mut sink = MemorySink::new();
        let started = Instant::now();
        let mut consumer = StreamConsumer::new(&mut transport, options);
        let summary = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &cancel)
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.records, 1);
        assert!(elapsed >= Duration::from_secs(25));
        assert!(elapsed < Duration::from_secs(26), "stopped after {:?}", elapsed);

        // One status for the record, the timer at 10s and 20s, then the final flush.
        let statuses = recorder.statuses();
        assert_eq!(statuses.len(), 4);
        assert_eq!(summary.statuses_sent, 4);
        assert_non_decreasing(&statuses);
        assert!(statuses.iter().all(|s| s.flushed == lsn(0x100)));
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let mut transport = MockTransport::new();
        transport.push_data(lsn(0x100), b"a");
        let recorder = transport.clone();

        let mut sink = MemorySink::failing("disk full");
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let err = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Sink);
        // Nothing was processed, so nothing is acknowledged.
        assert!(recorder.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure() {
        let mut transport = MockTransport::new().failing_start("replication slot \"slot\" does not exist");

        let mut sink = MemorySink::new();
        let mut consumer = StreamConsumer::new(&mut transport, ConsumerOptions::default());
        let err = consumer
            .consume("slot", Lsn::INVALID, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(sink.is_empty());
    }
}
