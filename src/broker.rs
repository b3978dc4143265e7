use crate::alarm::Alarm;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::time::Duration;

#[derive(Debug)]
pub enum Error {
    Timeout,
    ConnectionClosed,
    Rejected(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Error::*;
        match self {
            Timeout => f.write_str("Broker request timed out"),
            ConnectionClosed => f.write_str("Broker connection closed"),
            Rejected(reason) => write!(f, "Broker rejected request: {}", reason),
        }
    }
}

pub type BrokerResult<T> = Result<T, Error>;
pub type BrokerFuture<T> = Pin<Box<dyn Future<Output = BrokerResult<T>> + Send>>;

/// One subscriber's view of the push channel for a single alarm name.
/// Pushes arrive in the order the broker acknowledged the corresponding
/// sets, each delivered at most once.
pub struct Subscription {
    rx: UnboundedReceiver<Alarm>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(rx: UnboundedReceiver<Alarm>) -> Subscription {
        Subscription { rx, closed: false }
    }

    /// Next pending push, if one has already arrived.
    pub fn try_next(&mut self) -> Option<Alarm> {
        match self.rx.try_recv() {
            Ok(alarm) => Some(alarm),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    /// Wait for the next push. None means the transport is gone.
    pub async fn next(&mut self) -> Option<Alarm> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(alarm) => Some(alarm),
            None => {
                self.closed = true;
                None
            }
        }
    }

    pub fn ok(&self) -> bool {
        !self.closed
    }
}

/// The broker side of the protocol. Injected into broadcasters and
/// listeners so tests can run against an in-process broker.
pub trait BrokerLink: Send + Sync {
    /// Commit `alarm` as the current state for its name. On success the
    /// broker pushes the new state to every current subscriber of that
    /// name.
    fn set(&self, alarm: &Alarm) -> BrokerFuture<()>;

    /// Current committed state for `name`. A name that was never set
    /// reports the default cleared state, not an error.
    fn get(&self, name: &str) -> BrokerFuture<Alarm>;

    fn subscribe(&self, name: &str) -> BrokerFuture<Subscription>;

    /// Wait until the broker answers requests, up to `timeout`. Meant for
    /// startup health checks.
    fn wait_available(&self, timeout: Duration) -> BrokerFuture<()>;
}
