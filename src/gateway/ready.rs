//! Startup ready barrier.
//!
//! Right after a fresh identify the server streams a burst of bulk-state
//! dispatches (one GUILD_CREATE per guild announced in READY). The consumer
//! must not see "ready" until that burst has substantially arrived, and no
//! dispatch received meanwhile may be dropped or delivered early. The
//! barrier buffers everything, tracks the burst timing windows and the
//! member-chunk accounting, then replays the buffer in arrival order.
//!
//! The barrier itself does no I/O and owns no timer; the connection manager
//! selects on [`ReadyBarrier::deadline`] and feeds deadline/dispatch
//! observations back in.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::payload::Payload;

/// What the connection manager must do after a barrier observation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BarrierStep {
    /// keep waiting (possibly with a new deadline)
    Wait,
    /// send one member request per batch, then wait for the chunks
    RequestMembers(Vec<Vec<String>>),
    /// the wait resolved: fire ready once and drain the buffer
    Release,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    /// waiting up to the initial bound for the first bulk dispatch
    AwaitingFirstBulk,
    /// bulk dispatches arriving, rolling silence window
    Collecting,
    /// member requests sent, chunk series outstanding
    AwaitingChunks,
    /// barrier resolved, dispatches flow live
    Released,
}

/// Timing knobs of the barrier, see [`crate::config::Tuning`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct BarrierTiming {
    pub first_bulk_wait: Duration,
    pub silence_window: Duration,
    pub member_request_batch: usize,
}

#[derive(Debug)]
pub(crate) struct ReadyBarrier {
    timing: BarrierTiming,
    state: State,
    deadline: Option<Instant>,
    queue: VecDeque<Payload>,
    bulk_guilds: Vec<String>,
    pending_chunks: HashSet<String>,
    request_members: bool,
}

impl ReadyBarrier {
    /// Begin the barrier for a fresh epoch.
    ///
    /// `expect_bulk` is false for account kinds whose sessions get no
    /// bulk-state burst and for READY dispatches announcing zero guilds;
    /// those release immediately. `request_members` additionally gates the
    /// member-chunk acknowledgement round (bot sessions only).
    pub fn begin(
        timing: BarrierTiming,
        now: Instant,
        expect_bulk: bool,
        request_members: bool,
    ) -> Self {
        let (state, deadline) = if expect_bulk {
            (State::AwaitingFirstBulk, Some(now + timing.first_bulk_wait))
        } else {
            // resolve on the first poll
            (State::AwaitingFirstBulk, Some(now))
        };

        Self {
            timing,
            state,
            deadline,
            queue: VecDeque::new(),
            bulk_guilds: Vec::new(),
            pending_chunks: HashSet::new(),
            request_members,
        }
    }

    /// Whether dispatches must still be buffered.
    pub fn is_buffering(&self) -> bool {
        self.state != State::Released
    }

    /// Next instant the manager must call [`ReadyBarrier::on_deadline`] at.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Buffer one dispatch received during the wait.
    pub fn enqueue(&mut self, payload: Payload) {
        self.queue.push_back(payload);
    }

    /// Replay the buffer, strictly in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = Payload> + '_ {
        self.queue.drain(..)
    }

    /// Observe one bulk-state dispatch; extends the rolling silence window.
    pub fn observe_bulk(&mut self, guild_id: String, now: Instant) {
        match self.state {
            State::AwaitingFirstBulk | State::Collecting => {
                self.state = State::Collecting;
                self.deadline = Some(now + self.timing.silence_window);
                // redelivered bulk dispatches must not occupy a batch slot twice
                if !self.bulk_guilds.contains(&guild_id) {
                    self.bulk_guilds.push(guild_id);
                }
            }
            // late stragglers neither extend nor restart the window
            State::AwaitingChunks | State::Released => {}
        }
    }

    /// Observe one member chunk, releasing once every series completed.
    pub fn observe_chunk(&mut self, guild_id: &str, chunk_index: u64, chunk_count: u64) -> BarrierStep {
        if self.state != State::AwaitingChunks {
            return BarrierStep::Wait;
        }

        if chunk_index + 1 >= chunk_count && self.pending_chunks.remove(guild_id) {
            log::trace!("Member chunks complete for guild {}", guild_id);
        }

        if self.pending_chunks.is_empty() {
            self.release()
        } else {
            BarrierStep::Wait
        }
    }

    /// The deadline elapsed; decide the next step.
    pub fn on_deadline(&mut self) -> BarrierStep {
        match self.state {
            State::AwaitingFirstBulk => {
                // the burst never started (or none was expected)
                self.release()
            }
            State::Collecting => {
                if self.request_members && !self.bulk_guilds.is_empty() {
                    self.state = State::AwaitingChunks;
                    self.deadline = None;
                    self.pending_chunks = self.bulk_guilds.iter().cloned().collect();

                    let batches = self
                        .bulk_guilds
                        .chunks(self.timing.member_request_batch)
                        .map(<[String]>::to_vec)
                        .collect();
                    BarrierStep::RequestMembers(batches)
                } else {
                    self.release()
                }
            }
            State::AwaitingChunks | State::Released => BarrierStep::Wait,
        }
    }

    fn release(&mut self) -> BarrierStep {
        if self.state == State::Released {
            return BarrierStep::Wait;
        }
        self.state = State::Released;
        self.deadline = None;
        BarrierStep::Release
    }
}
