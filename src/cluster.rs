//! Multi-shard supervision.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::Poll,
};

use futures_util::{future, Stream, StreamExt};
use snafu::prelude::*;
use tokio::sync::mpsc;

use crate::{
    api,
    config::{Config, Shard},
    error::{self, Result},
    gateway::{Connection, Dispatch, Event, EventStream, IdentifyLimiter},
};

/// Consumer-visible event of a cluster.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// one shard completed its startup sequence
    ShardReady {
        /// the shard that became ready
        shard: Shard,
        /// its session id
        session_id: String,
    },
    /// every shard is ready; fires once, when the last shard (by ascending
    /// shard id) reaches its own ready
    Ready {
        /// session id of the last shard
        session_id: String,
        /// gateway server names of the last shard
        trace: Vec<String>,
    },
    /// one shard recovered a transient disconnect by resuming
    Resumed {
        /// the shard that resumed
        shard: Shard,
    },
    /// an application-level dispatch
    Dispatch {
        /// shard the dispatch arrived on
        shard: Shard,
        /// the dispatch itself
        dispatch: Dispatch,
    },
}

/// Merged event stream of all shards.
#[derive(Debug)]
pub struct ClusterStream {
    rx: mpsc::Receiver<ClusterEvent>,
}

impl Stream for ClusterStream {
    type Item = ClusterEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A set of shard connections sharing one credential.
///
/// All shards run fully in parallel, coordinated only through the shared
/// identify limiter. The first shard terminating with an unrecoverable
/// error stops the whole cluster and [`Cluster::run`] surfaces that error.
#[derive(Debug)]
pub struct Cluster {
    connections: Vec<Arc<Connection>>,
    streams: Mutex<Option<Vec<EventStream>>>,
    events: mpsc::Sender<ClusterEvent>,
    last_shard_id: u32,
}

impl Cluster {
    /// Create `shard_count` connections for the credential in `config`.
    pub fn new(config: Config, shard_count: u32) -> Result<(Self, ClusterStream)> {
        let rest = Arc::new(
            api::Client::new(&config.token, config.account_kind).context(error::CallAPIFailed)?,
        );
        let limiter = Arc::new(IdentifyLimiter::new(config.tuning.identify_reset_after));
        let (events, event_rx) = mpsc::channel(64);

        let mut connections = Vec::with_capacity(shard_count as usize);
        let mut streams = Vec::with_capacity(shard_count as usize);
        for id in 0..shard_count {
            let shard = Shard {
                id,
                count: shard_count,
            };
            let (connection, stream) =
                Connection::new(config.clone(), Some(shard), rest.clone(), limiter.clone());
            connections.push(Arc::new(connection));
            streams.push(stream);
        }

        Ok((
            Self {
                connections,
                streams: Mutex::new(Some(streams)),
                events,
                last_shard_id: shard_count.saturating_sub(1),
            },
            ClusterStream { rx: event_rx },
        ))
    }

    /// Request graceful shutdown of every shard. Idempotent.
    pub fn stop(&self) {
        for connection in &self.connections {
            connection.stop();
        }
    }

    /// Run every shard until the cluster is permanently stopped.
    ///
    /// Resolves `Ok` after [`Cluster::stop`]; resolves with the first
    /// shard's unrecoverable error otherwise, after stopping the rest. A
    /// cluster consumes its event streams and runs once.
    pub async fn run(&self) -> Result<()> {
        let streams = self
            .streams
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| error::AlreadyRunning.build())?;

        log::info!("Starting cluster with {} shards", self.connections.len());

        let cluster_ready_fired = Arc::new(AtomicBool::new(false));
        for (connection, stream) in self.connections.iter().zip(streams) {
            // the connection guarantees at-most-once ready per epoch; this
            // task only tags events with the shard and aggregates the
            // cluster-wide ready
            tokio::spawn(forward_shard_events(
                stream,
                // shards are always constructed with an identity
                connection.shard().unwrap(),
                self.last_shard_id,
                self.events.clone(),
                cluster_ready_fired.clone(),
            ));
        }

        let mut remaining: Vec<_> = self
            .connections
            .iter()
            .map(|connection| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.run().await })
            })
            .collect();

        let mut result = Ok(());
        while !remaining.is_empty() {
            let (finished, _, rest) = future::select_all(remaining).await;
            remaining = rest;

            if let Err(err) = finished.unwrap() {
                if result.is_ok() {
                    log::error!("Shard terminated with unrecoverable error, stopping cluster");
                    result = Err(err);
                    self.stop();
                }
            }
        }

        result
    }
}

async fn forward_shard_events(
    mut stream: EventStream,
    shard: Shard,
    last_shard_id: u32,
    events: mpsc::Sender<ClusterEvent>,
    cluster_ready_fired: Arc<AtomicBool>,
) {
    while let Some(event) = stream.next().await {
        let forward = match event {
            Event::Ready {
                session_id, trace, ..
            } => {
                let shard_ready = ClusterEvent::ShardReady {
                    shard,
                    session_id: session_id.clone(),
                };
                if events.send(shard_ready).await.is_err() {
                    break;
                }

                if shard.id == last_shard_id
                    && !cluster_ready_fired.swap(true, Ordering::SeqCst)
                {
                    log::info!("All shards ready");
                    Some(ClusterEvent::Ready { session_id, trace })
                } else {
                    None
                }
            }
            Event::Resumed => Some(ClusterEvent::Resumed { shard }),
            Event::Dispatch(dispatch) => Some(ClusterEvent::Dispatch { shard, dispatch }),
        };

        if let Some(event) = forward {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }

    log::debug!("Shard #{} event forwarder stop", shard.id);
}
