//! Per-shard gateway connection manager.
//!
//! Owns the socket, the heartbeat worker, the session state and the ready
//! barrier for one shard, and drives the reconnect-with-backoff loop. The
//! identify limiter is the only thing shared with sibling shards.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{future, stream::SplitSink, SinkExt, StreamExt};
use snafu::prelude::*;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_tungstenite as websocket;

use super::{
    close::{self, CloseBehavior},
    event::{Dispatch, Event, EventStream},
    heartbeat::{HeartbeatHealth, HeartbeatWorker, WorkerSignal},
    identify::IdentifyLimiter,
    payload::{dispatch, GuildMembersChunkData, GuildStub, HelloData, Opcode, Payload, ReadyData},
    ready::{BarrierStep, BarrierTiming, ReadyBarrier},
    session::Session,
    stream::{PayloadStreamError, PayloadStreamSink},
};
use crate::{
    api,
    config::{AccountKind, Config, Shard},
    error::Error,
};

/// how long the writer task gets to flush the close frame at epoch teardown
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How one connection epoch ended.
#[derive(Debug)]
enum Epoch {
    /// manual stop, or the consumer dropped the event stream
    Stopped,
    /// reconnect; `failed_attempt` selects the fixed backoff before retrying
    Retry {
        /// true when the epoch never reached an established session
        failed_attempt: bool,
    },
    /// unrecoverable, terminate the manager
    Fatal(Error),
}

/// A managed gateway connection for one shard.
///
/// [`Connection::run`] resolves only when the connection is permanently
/// stopped: `Ok` after [`Connection::stop`], `Err` on an unrecoverable
/// error. Transient failures reconnect internally, resuming the session
/// when the server allows it.
#[derive(Debug)]
pub struct Connection {
    config: Config,
    shard: Option<Shard>,
    rest: Arc<api::Client>,
    limiter: Arc<IdentifyLimiter>,
    health: Arc<HeartbeatHealth>,
    events: mpsc::Sender<Event>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection manager and the event stream it feeds.
    pub fn new(
        config: Config,
        shard: Option<Shard>,
        rest: Arc<api::Client>,
        limiter: Arc<IdentifyLimiter>,
    ) -> (Self, EventStream) {
        let (events, event_rx) = mpsc::channel(32);
        let (stop_tx, _) = watch::channel(false);

        (
            Self {
                config,
                shard,
                rest,
                limiter,
                health: Arc::new(HeartbeatHealth::default()),
                events,
                running: AtomicBool::new(false),
                stop_tx,
            },
            EventStream { rx: event_rx },
        )
    }

    /// Create an unsharded connection with its own REST client and
    /// identify limiter.
    pub fn single(config: Config) -> Result<(Self, EventStream), Error> {
        let rest = Arc::new(
            api::Client::new(&config.token, config.account_kind)
                .context(crate::error::CallAPIFailed)?,
        );
        let limiter = Arc::new(IdentifyLimiter::new(config.tuning.identify_reset_after));
        Ok(Self::new(config, None, rest, limiter))
    }

    /// Shard identity of this connection.
    pub fn shard(&self) -> Option<Shard> {
        self.shard
    }

    /// Last observed heartbeat round-trip latency.
    pub fn latency(&self) -> Option<Duration> {
        self.health.latency()
    }

    /// Request graceful shutdown. Idempotent; a no-op when not running.
    pub fn stop(&self) {
        log::info!("{}: stop requested", self.describe());
        let _ = self.stop_tx.send(true);
    }

    fn describe(&self) -> String {
        match self.shard {
            Some(shard) => format!("Gateway #{}", shard.id),
            None => "Gateway".to_string(),
        }
    }

    /// Run the connection until permanently stopped.
    ///
    /// Only a [`Connection::stop`] issued while running takes effect; a
    /// stop that arrived before this call is discarded when the run begins.
    pub async fn run(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        self.stop_tx.send_replace(false);
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<(), Error> {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut session = Session::new();
        let mut backoff = false;

        loop {
            if *stop_rx.borrow() {
                log::info!("{}: stopped", self.describe());
                return Ok(());
            }

            if backoff {
                let delay = self.config.tuning.reconnect_delay;
                log::warn!(
                    "{}: connection attempt failed, retrying in {:?}",
                    self.describe(),
                    delay
                );
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => continue,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.epoch(&mut session, &mut stop_rx).await {
                Epoch::Stopped => {
                    log::info!("{}: stopped", self.describe());
                    return Ok(());
                }
                Epoch::Retry { failed_attempt } => {
                    backoff = failed_attempt;
                }
                Epoch::Fatal(err) => {
                    return Err(self.fail_permanently(&mut session, err));
                }
            }
        }
    }

    /// Discard all per-session state and surface the terminal error.
    fn fail_permanently(&self, session: &mut Session, err: Error) -> Error {
        // a dead session must not be resumed by a later run
        session.reset();
        self.health.reset();
        log::error!("{}: unrecoverable error: {}", self.describe(), err);
        err
    }

    fn close_outcome(&self, code: Option<u16>, reason: &str, established: bool) -> Epoch {
        match close::classify(code) {
            CloseBehavior::Fatal => Epoch::Fatal(Error::FatalClose {
                // classify(None) is never fatal
                code: code.unwrap_or_default(),
                reason: reason.to_string(),
            }),
            CloseBehavior::Retryable => Epoch::Retry {
                failed_attempt: !established,
            },
        }
    }

    fn send_outcome(&self, err: PayloadStreamError) -> Epoch {
        log::warn!(
            "{}: find payload stream broken when send: {}",
            self.describe(),
            err
        );
        match err {
            PayloadStreamError::Closed { code, reason } => {
                self.close_outcome(code, &reason, false)
            }
            _ => Epoch::Retry {
                failed_attempt: true,
            },
        }
    }

    fn plan_handshake(&self, session: &Session) -> HandshakePlan {
        match session.session_id() {
            Some(session_id) => HandshakePlan::Resume(Payload::resume(
                &self.config.token,
                session_id,
                session.last_sequence(),
            )),
            None => HandshakePlan::Identify(Payload::identify(
                &self.config.token,
                &self.config.properties,
                self.shard,
                self.config.compress,
            )),
        }
    }

    /// One full connection attempt: url, socket, hello, handshake, stream.
    async fn epoch(&self, session: &mut Session, stop_rx: &mut watch::Receiver<bool>) -> Epoch {
        let tuning = self.config.tuning;
        let fresh = !session.can_resume();

        log::info!(
            "{}: connecting ({})...",
            self.describe(),
            if fresh { "identify" } else { "resume" }
        );

        let url = tokio::select! {
            biased;
            _ = stop_rx.changed() => return Epoch::Stopped,
            result = self.rest.get_gateway(fresh) => match result {
                Ok(url) => url,
                Err(api::Error::SessionLimit { resets_after }) => {
                    return Epoch::Fatal(Error::SessionLimit { resets_after })
                }
                Err(api::Error::Unauthorized { .. }) => {
                    return Epoch::Fatal(Error::AuthenticationFailed)
                }
                Err(err) => {
                    log::warn!("{}: get gateway url failed: {}", self.describe(), err);
                    return Epoch::Retry { failed_attempt: true };
                }
            }
        };

        let mut gateway_url = match url::Url::parse(&url) {
            Ok(url) => url,
            Err(err) => {
                log::warn!("{}: invalid gateway url {}: {}", self.describe(), url, err);
                return Epoch::Retry {
                    failed_attempt: true,
                };
            }
        };
        gateway_url
            .query_pairs_mut()
            .append_pair("v", "9")
            .append_pair("encoding", "json");

        log::debug!("Connecting gateway: {}", gateway_url);

        let ws = tokio::select! {
            biased;
            _ = stop_rx.changed() => return Epoch::Stopped,
            result = websocket::connect_async(gateway_url.as_str()) => match result {
                Ok((ws, _)) => ws,
                Err(err) => {
                    log::warn!("{}: connect gateway failed: {}", self.describe(), err);
                    return Epoch::Retry { failed_attempt: true };
                }
            }
        };

        let mut payload_stream = PayloadStreamSink::new(ws, self.config.compress);

        // first frame must be the server hello carrying the heartbeat interval
        let hello = {
            let deadline = Instant::now() + tuning.hello_timeout;
            log::debug!("Waiting hello payload, timeout tick: {:?}", deadline);

            'hello: loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return Epoch::Stopped,
                    _ = tokio::time::sleep_until(deadline) => {
                        log::warn!("{}: wait hello timeout", self.describe());
                        return Epoch::Retry { failed_attempt: true };
                    }
                    item = payload_stream.next() => match item {
                        None => {
                            log::warn!("{}: connection ended before hello", self.describe());
                            return Epoch::Retry { failed_attempt: true };
                        }
                        Some(Err(err)) if !err.is_fatal() => {
                            log::warn!("Payload stream error happened but ignored: {}", err);
                        }
                        Some(Err(PayloadStreamError::Closed { code, reason })) => {
                            log::warn!("{}: close during handshake: {:?} {}", self.describe(), code, reason);
                            return self.close_outcome(code, &reason, false);
                        }
                        Some(Err(err)) => {
                            log::warn!("{}: payload stream broken before hello: {}", self.describe(), err);
                            return Epoch::Retry { failed_attempt: true };
                        }
                        Some(Ok(payload)) if payload.op == Opcode::Hello => break 'hello payload,
                        Some(Ok(payload)) => {
                            log::warn!("{}: first payload has opcode {:?}, not hello", self.describe(), payload.op);
                            return Epoch::Retry { failed_attempt: true };
                        }
                    }
                }
            }
        };

        let hello: HelloData = match hello.parse_data() {
            Ok(data) => data,
            Err(err) => {
                log::warn!("{}: parse hello data failed: {}", self.describe(), err);
                return Epoch::Retry {
                    failed_attempt: true,
                };
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        session.observe_hello(interval, hello.trace);
        log::debug!("Hello received, heartbeat interval {:?}", interval);

        // handshake: resume reuses the session without consulting the
        // limiter, identify serializes across sibling shards
        match self.plan_handshake(session) {
            HandshakePlan::Resume(payload) => {
                log::info!(
                    "{}: resuming session {}",
                    self.describe(),
                    session.session_id().unwrap_or_default()
                );
                if let Err(err) = payload_stream.send(payload).await {
                    return self.send_outcome(err);
                }
            }
            HandshakePlan::Identify(payload) => {
                log::debug!("Waiting identify slot");
                let permit = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return Epoch::Stopped,
                    permit = self.limiter.acquire() => permit,
                };

                log::info!("{}: identifying...", self.describe());
                let result = payload_stream.send(payload).await;

                // the remote limit is about identify send rate, not handshake
                // completion, so the slot frees right after the send
                permit.release();

                if let Err(err) = result {
                    return self.send_outcome(err);
                }
            }
        }

        self.health.reset();

        let (sink, mut reader) = payload_stream.split();
        let (outbox_tx, outbox_rx) = mpsc::channel::<Payload>(16);
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        let (seq_tx, seq_rx) = watch::channel(session.last_sequence());
        let (hb_shutdown_tx, hb_shutdown_rx) = watch::channel(false);

        let mut writer = tokio::spawn(write_loop(outbox_rx, sink));
        tokio::spawn(
            HeartbeatWorker {
                interval,
                outbox: outbox_tx.clone(),
                seq_rx,
                health: self.health.clone(),
                signal_tx,
                shutdown_rx: hb_shutdown_rx,
            }
            .run(),
        );

        let mut barrier: Option<ReadyBarrier> = None;
        let mut established = false;

        let outcome = 'receive: loop {
            let barrier_deadline = barrier.as_ref().and_then(|b| b.deadline());
            let barrier_clock = async move {
                match barrier_deadline {
                    Some(tick) => tokio::time::sleep_until(tick).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = stop_rx.changed() => break 'receive Epoch::Stopped,

                Some(signal) = signal_rx.recv() => match signal {
                    WorkerSignal::HeartbeatTimeout => {
                        log::warn!("{}: heartbeat ack missed, force closing", self.describe());
                        break 'receive Epoch::Retry { failed_attempt: false };
                    }
                },

                _ = barrier_clock, if barrier_deadline.is_some() => {
                    // barrier_deadline is only set while the barrier exists
                    let step = barrier.as_mut().unwrap().on_deadline();
                    match step {
                        BarrierStep::Wait => {}
                        BarrierStep::RequestMembers(batches) => {
                            log::info!(
                                "{}: requesting members in {} batches",
                                self.describe(),
                                batches.len()
                            );
                            for batch in batches {
                                let request = Payload::request_guild_members(&batch);
                                if outbox_tx.send(request).await.is_err() {
                                    break 'receive Epoch::Retry { failed_attempt: false };
                                }
                            }
                        }
                        BarrierStep::Release => {
                            let released = release_barrier(
                                &self.events,
                                barrier.as_mut().unwrap(),
                                session,
                                self.shard,
                            )
                            .await;
                            if !released {
                                break 'receive Epoch::Stopped;
                            }
                        }
                    }
                }

                item = reader.next() => match item {
                    None => {
                        log::warn!("{}: connection ended without close frame", self.describe());
                        break 'receive self.close_outcome(None, "", established);
                    }
                    Some(Err(err)) if !err.is_fatal() => {
                        log::warn!("Payload stream error happened but ignored: {}", err);
                    }
                    Some(Err(PayloadStreamError::Closed { code, reason })) => {
                        log::warn!("{}: close: {:?} {}", self.describe(), code, reason);
                        break 'receive self.close_outcome(code, &reason, established);
                    }
                    Some(Err(err)) => {
                        log::warn!(
                            "{}: find payload stream broken when receive: {}",
                            self.describe(),
                            err
                        );
                        break 'receive Epoch::Retry { failed_attempt: !established };
                    }
                    Some(Ok(payload)) => {
                        log::trace!("Received payload with opcode {:?}", payload.op);

                        match payload.op {
                            Opcode::Dispatch => {
                                session.observe_sequence(payload.s);
                                let _ = seq_tx.send(session.last_sequence());

                                match self
                                    .handle_dispatch(payload, session, &mut barrier, &mut established)
                                    .await
                                {
                                    Step::Continue => {}
                                    Step::Break(epoch) => break 'receive epoch,
                                }
                            }
                            Opcode::Heartbeat => {
                                log::trace!("Server requested an immediate heartbeat");
                                let beat = Payload::heartbeat(session.last_sequence());
                                if outbox_tx.send(beat).await.is_err() {
                                    break 'receive Epoch::Retry { failed_attempt: false };
                                }
                            }
                            Opcode::HeartbeatAck => {
                                self.health.record_ack();
                                log::trace!("Heartbeat acked, latency {:?}", self.health.latency());
                            }
                            Opcode::Reconnect => {
                                log::info!("{}: server requested reconnect", self.describe());
                                break 'receive Epoch::Retry { failed_attempt: false };
                            }
                            Opcode::InvalidSession => {
                                let resumable = payload.d.as_bool().unwrap_or(false);
                                log::warn!(
                                    "{}: session invalidated, resumable: {}",
                                    self.describe(),
                                    resumable
                                );
                                session.observe_invalid_session(resumable);
                                break 'receive Epoch::Retry { failed_attempt: false };
                            }
                            op => {
                                log::debug!("Ignore payload with opcode {:?}", op);
                            }
                        }
                    }
                }
            }
        };

        // the worker must be fully stopped before a new epoch's timer starts
        drop(hb_shutdown_tx);
        drop(outbox_tx);
        drop(reader);

        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }

        outcome
    }

    async fn handle_dispatch(
        &self,
        payload: Payload,
        session: &mut Session,
        barrier: &mut Option<ReadyBarrier>,
        established: &mut bool,
    ) -> Step {
        match payload.kind() {
            dispatch::READY => {
                let ready: ReadyData = match payload.parse_data() {
                    Ok(data) => data,
                    Err(err) => {
                        log::warn!("{}: parse READY failed: {}", self.describe(), err);
                        return Step::Continue;
                    }
                };

                *established = true;
                let guild_count = ready.guilds.len();
                session.observe_ready(ready.session_id, ready.trace);

                log::info!(
                    "{}: handshake complete, session {}, {} guilds announced",
                    self.describe(),
                    session.session_id().unwrap_or_default(),
                    guild_count
                );

                // user sessions get no bulk burst, bot sessions additionally
                // acknowledge member data per guild
                let is_bot = self.config.account_kind == AccountKind::Bot;
                barrier.replace(ReadyBarrier::begin(
                    BarrierTiming {
                        first_bulk_wait: self.config.tuning.ready_first_bulk_wait,
                        silence_window: self.config.tuning.ready_silence_window,
                        member_request_batch: self.config.tuning.member_request_batch,
                    },
                    Instant::now(),
                    is_bot && guild_count > 0,
                    is_bot,
                ));

                Step::Continue
            }
            dispatch::RESUMED => {
                *established = true;
                log::info!("{}: session resumed", self.describe());
                if self.events.send(Event::Resumed).await.is_err() {
                    return Step::Break(Epoch::Stopped);
                }
                Step::Continue
            }
            dispatch::GUILD_CREATE => {
                if let Some(b) = barrier.as_mut().filter(|b| b.is_buffering()) {
                    if let Ok(guild) = payload.parse_data::<GuildStub>() {
                        b.observe_bulk(guild.id, Instant::now());
                    }
                    b.enqueue(payload);
                    Step::Continue
                } else {
                    self.forward(payload).await
                }
            }
            dispatch::GUILD_MEMBERS_CHUNK => {
                if let Some(b) = barrier.as_mut().filter(|b| b.is_buffering()) {
                    let step = match payload.parse_data::<GuildMembersChunkData>() {
                        Ok(chunk) => {
                            b.observe_chunk(&chunk.guild_id, chunk.chunk_index, chunk.chunk_count)
                        }
                        Err(err) => {
                            log::warn!("Parse member chunk failed: {}", err);
                            BarrierStep::Wait
                        }
                    };
                    b.enqueue(payload);

                    if step == BarrierStep::Release {
                        let released =
                            release_barrier(&self.events, b, session, self.shard).await;
                        if !released {
                            return Step::Break(Epoch::Stopped);
                        }
                    }
                    Step::Continue
                } else {
                    self.forward(payload).await
                }
            }
            _ => {
                if let Some(b) = barrier.as_mut().filter(|b| b.is_buffering()) {
                    log::trace!("Buffer {} dispatch until ready releases", payload.kind());
                    b.enqueue(payload);
                    Step::Continue
                } else {
                    self.forward(payload).await
                }
            }
        }
    }

    async fn forward(&self, payload: Payload) -> Step {
        if forward_dispatch(&self.events, payload).await {
            Step::Continue
        } else {
            log::debug!("Send event to event stream failed, means receive side dropped, stop");
            Step::Break(Epoch::Stopped)
        }
    }
}

/// Outcome of handling one payload inside the receive loop.
enum Step {
    Continue,
    Break(Epoch),
}

/// Handshake frame decided from the session state. Only a fresh identify
/// consults the identify limiter; resumes never touch it.
enum HandshakePlan {
    Resume(Payload),
    Identify(Payload),
}

async fn write_loop(
    mut outbox_rx: mpsc::Receiver<Payload>,
    mut sink: SplitSink<PayloadStreamSink, Payload>,
) {
    while let Some(payload) = outbox_rx.recv().await {
        if let Err(err) = sink.send(payload).await {
            log::warn!("Find payload sink broken when send: {}", err);
            break;
        }
    }
    let _ = sink.close().await;
    log::debug!("Writer task stop");
}

async fn forward_dispatch(events: &mpsc::Sender<Event>, payload: Payload) -> bool {
    let Payload { d, s, t, .. } = payload;
    events
        .send(Event::Dispatch(Dispatch {
            kind: t.unwrap_or_default(),
            seq: s,
            data: d,
        }))
        .await
        .is_ok()
}

/// Replay the buffered dispatches in arrival order, then fire ready once.
async fn release_barrier(
    events: &mpsc::Sender<Event>,
    barrier: &mut ReadyBarrier,
    session: &Session,
    shard: Option<Shard>,
) -> bool {
    let queued: Vec<Payload> = barrier.drain().collect();
    log::info!(
        "Startup state received, replaying {} buffered dispatches",
        queued.len()
    );

    for payload in queued {
        if !forward_dispatch(events, payload).await {
            return false;
        }
    }

    let ready = Event::Ready {
        session_id: session.session_id().unwrap_or_default().to_string(),
        trace: session.trace().to_vec(),
        shard,
    };

    events.send(ready).await.is_ok()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn connection() -> Connection {
        Connection::single(Config::bot("token")).unwrap().0
    }

    fn dispatch_payload(seq: u64) -> Payload {
        Payload {
            op: Opcode::Dispatch,
            d: json!({}),
            s: Some(seq),
            t: Some("MESSAGE_CREATE".to_string()),
        }
    }

    #[test]
    fn test_fatal_close_code_terminates_without_retry() {
        let connection = connection();

        assert!(matches!(
            connection.close_outcome(Some(close::AUTHENTICATION_FAILED), "bad token", true),
            Epoch::Fatal(Error::FatalClose { code: 4004, .. })
        ));
    }

    #[test]
    fn test_retryable_close_code_reconnects() {
        let connection = connection();

        // a live session reconnects immediately
        assert!(matches!(
            connection.close_outcome(Some(1006), "", true),
            Epoch::Retry {
                failed_attempt: false
            }
        ));

        // losing the connection before the handshake is a failed attempt
        assert!(matches!(
            connection.close_outcome(None, "", false),
            Epoch::Retry {
                failed_attempt: true
            }
        ));
    }

    #[test]
    fn test_unrecoverable_error_discards_session() {
        let connection = connection();
        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec![]);
        session.observe_sequence(Some(9));

        let err = connection.fail_permanently(&mut session, Error::AuthenticationFailed);

        assert!(matches!(err, Error::AuthenticationFailed));
        assert!(!session.can_resume());
        assert_eq!(session.last_sequence(), None);
    }

    #[test]
    fn test_fresh_session_plans_identify() {
        let connection = connection();
        let session = Session::new();

        match connection.plan_handshake(&session) {
            HandshakePlan::Identify(payload) => {
                assert_eq!(payload.op, Opcode::Identify);
                assert_eq!(payload.d["token"], "token");
            }
            HandshakePlan::Resume(_) => panic!("fresh session must identify"),
        }
    }

    #[tokio::test]
    async fn test_resumable_session_plans_resume_without_identify_slot() {
        let connection = connection();

        // hold the only identify slot; planning a resume must not need it
        let _held = connection.limiter.acquire().await;

        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec![]);
        session.observe_sequence(Some(42));

        match connection.plan_handshake(&session) {
            HandshakePlan::Resume(payload) => {
                assert_eq!(payload.op, Opcode::Resume);
                assert_eq!(payload.d["session_id"], "abc");
                assert_eq!(payload.d["seq"], 42);
            }
            HandshakePlan::Identify(_) => panic!("resumable session must not identify"),
        }
    }

    #[tokio::test]
    async fn test_second_run_rejected_and_prestart_stop_discarded() {
        let connection = Arc::new(connection());

        // a stop issued before run only affects a running connection
        connection.stop();

        let running = tokio::spawn({
            let connection = connection.clone();
            async move { connection.run().await }
        });
        tokio::task::yield_now().await;

        assert!(matches!(connection.run().await, Err(Error::AlreadyRunning)));

        connection.stop();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ready_fires_after_buffered_replay() {
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let timing = BarrierTiming {
            first_bulk_wait: Duration::from_secs(3),
            silence_window: Duration::from_millis(3500),
            member_request_batch: 75,
        };
        let mut barrier = ReadyBarrier::begin(timing, Instant::now(), false, false);
        barrier.enqueue(dispatch_payload(1));
        barrier.enqueue(dispatch_payload(2));

        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec![]);

        assert!(release_barrier(&events_tx, &mut barrier, &session, None).await);

        for seq in [1, 2] {
            match events_rx.recv().await.unwrap() {
                Event::Dispatch(dispatch) => assert_eq!(dispatch.seq, Some(seq)),
                event => panic!("expected buffered dispatch, got {:?}", event),
            }
        }
        match events_rx.recv().await.unwrap() {
            Event::Ready { session_id, .. } => assert_eq!(session_id, "abc"),
            event => panic!("expected ready after replay, got {:?}", event),
        }
    }
}
