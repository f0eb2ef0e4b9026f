//! Heartbeat worker task.

use std::{
    sync::Mutex,
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use super::payload::Payload;

/// Signal from a worker task to the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerSignal {
    /// a heartbeat went unacknowledged for a full interval
    HeartbeatTimeout,
}

#[derive(Debug, Default, Clone, Copy)]
struct HealthInner {
    last_sent: Option<Instant>,
    last_acked: Option<Instant>,
    awaiting_ack: bool,
}

/// Observable heartbeat health for one connection.
///
/// Shared between the worker (send bookkeeping), the receive loop (acks) and
/// the consumer (latency readout). Reset on every (re)connect.
#[derive(Debug, Default)]
pub struct HeartbeatHealth {
    inner: Mutex<HealthInner>,
}

impl HeartbeatHealth {
    /// Acknowledgement latency of the last heartbeat round-trip, when one
    /// completed this epoch.
    pub fn latency(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match (inner.last_sent, inner.last_acked) {
            (Some(sent), Some(acked)) if acked >= sent => Some(acked - sent),
            _ => None,
        }
    }

    pub(crate) fn record_sent(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_sent = Some(Instant::now());
        inner.awaiting_ack = true;
    }

    pub(crate) fn record_ack(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_acked = Some(Instant::now());
        inner.awaiting_ack = false;
    }

    pub(crate) fn missed(&self) -> bool {
        self.inner.lock().unwrap().awaiting_ack
    }

    pub(crate) fn reset(&self) {
        *self.inner.lock().unwrap() = HealthInner::default();
    }
}

/// Per-epoch heartbeat worker.
///
/// Runs on its own schedule, independent from the receive loop: every
/// interval it sends one heartbeat carrying the latest sequence number. If
/// the previous beat was never acked by then, it reports
/// [`WorkerSignal::HeartbeatTimeout`] and stops, which makes the manager
/// force-close the socket.
#[derive(Debug)]
pub(crate) struct HeartbeatWorker {
    pub interval: Duration,
    pub outbox: mpsc::Sender<Payload>,
    pub seq_rx: watch::Receiver<Option<u64>>,
    pub health: std::sync::Arc<HeartbeatHealth>,
    pub signal_tx: mpsc::Sender<WorkerSignal>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl HeartbeatWorker {
    pub async fn run(mut self) {
        log::debug!("Heartbeat worker start, interval {:?}", self.interval);

        let mut beat_tick = Instant::now() + self.interval;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    log::debug!("Heartbeat worker shutdown requested");
                    break;
                }

                _ = tokio::time::sleep_until(beat_tick) => {
                    if self.health.missed() {
                        log::warn!("Heartbeat not acknowledged within one interval, reporting dead connection");
                        let _ = self.signal_tx.send(WorkerSignal::HeartbeatTimeout).await;
                        break;
                    }

                    let seq = *self.seq_rx.borrow();
                    log::trace!("Send heartbeat with seq {:?}", seq);

                    if self.outbox.send(Payload::heartbeat(seq)).await.is_err() {
                        log::debug!("Heartbeat worker find outbox closed, stop");
                        break;
                    }

                    self.health.record_sent();
                    beat_tick = Instant::now() + self.interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::payload::Opcode;

    struct Harness {
        outbox_rx: mpsc::Receiver<Payload>,
        signal_rx: mpsc::Receiver<WorkerSignal>,
        seq_tx: watch::Sender<Option<u64>>,
        shutdown_tx: watch::Sender<bool>,
        health: Arc<HeartbeatHealth>,
    }

    fn spawn_worker(interval: Duration) -> Harness {
        let (outbox_tx, outbox_rx) = mpsc::channel(8);
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (seq_tx, seq_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = Arc::new(HeartbeatHealth::default());

        tokio::spawn(
            HeartbeatWorker {
                interval,
                outbox: outbox_tx,
                seq_rx,
                health: health.clone(),
                signal_tx,
                shutdown_rx,
            }
            .run(),
        );

        Harness {
            outbox_rx,
            signal_rx,
            seq_tx,
            shutdown_tx,
            health,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_carry_latest_sequence() {
        let mut harness = spawn_worker(Duration::from_secs(10));
        harness.seq_tx.send(Some(42)).unwrap();

        let beat = harness.outbox_rx.recv().await.unwrap();
        assert_eq!(beat.op, Opcode::Heartbeat);
        assert_eq!(beat.d.as_u64(), Some(42));

        harness.health.record_ack();
        harness.seq_tx.send(Some(43)).unwrap();

        let beat = harness.outbox_rx.recv().await.unwrap();
        assert_eq!(beat.d.as_u64(), Some(43));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ack_signals_timeout_within_one_interval() {
        let interval = Duration::from_secs(10);
        let mut harness = spawn_worker(interval);

        let started = Instant::now();

        // first beat goes out, nobody acks it
        let _ = harness.outbox_rx.recv().await.unwrap();

        let signal = harness.signal_rx.recv().await.unwrap();
        assert_eq!(signal, WorkerSignal::HeartbeatTimeout);
        assert!(Instant::now() - started <= interval * 2);

        // worker stopped, outbox side closes
        assert!(harness.outbox_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_beats_keep_flowing() {
        let mut harness = spawn_worker(Duration::from_secs(10));

        for _ in 0..3 {
            let beat = harness.outbox_rx.recv().await.unwrap();
            assert_eq!(beat.op, Opcode::Heartbeat);
            harness.health.record_ack();
        }

        assert!(harness.health.latency().is_some());
        assert!(harness.signal_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker_before_next_beat() {
        let mut harness = spawn_worker(Duration::from_secs(10));

        let _ = harness.outbox_rx.recv().await.unwrap();
        harness.health.record_ack();

        harness.shutdown_tx.send(true).unwrap();

        assert!(harness.outbox_rx.recv().await.is_none());
    }
}
