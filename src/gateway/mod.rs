//! Gateway session/connection machinery.

pub mod close;
mod connection;
mod event;
mod heartbeat;
mod identify;
pub mod payload;
mod ready;
mod session;
mod stream;

pub use connection::Connection;
pub use event::{Dispatch, Event, EventStream};
pub use heartbeat::HeartbeatHealth;
pub use identify::{IdentifyLimiter, IdentifyPermit};
pub use session::Session;
pub use stream::{PayloadStreamError, PayloadStreamSink};
