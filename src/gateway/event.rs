//! Consumer-facing gateway events.

use std::task::Poll;

use enum_as_inner::EnumAsInner;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Shard;

/// One application-level dispatch forwarded from the gateway.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// dispatch type name, e.g. `MESSAGE_CREATE`
    pub kind: String,
    /// sequence number the envelope carried
    pub seq: Option<u64>,
    /// raw dispatch data
    pub data: Value,
}

/// Consumer-visible event of one shard connection.
#[derive(Debug, Clone, EnumAsInner)]
pub enum Event {
    /// a fresh session completed its startup sequence; fires at most once
    /// per connection epoch, after the buffered startup dispatches replayed
    Ready {
        /// session id for later resumes
        session_id: String,
        /// connected gateway server names
        trace: Vec<String>,
        /// shard identity, absent for unsharded connections
        shard: Option<Shard>,
    },
    /// a transient disconnect was recovered by a resume
    Resumed,
    /// an application-level dispatch, in arrival order
    Dispatch(Dispatch),
}

/// Stream of [`Event`] for one shard connection.
///
/// Events arrive in the exact order the gateway delivered them, except the
/// startup window where buffered dispatches are replayed in original order
/// and `Ready` follows the replay. Dropping the stream stops the connection.
#[derive(Debug)]
pub struct EventStream {
    pub(crate) rx: mpsc::Receiver<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
