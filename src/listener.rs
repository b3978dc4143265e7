use crate::alarm::Alarm;
use crate::broker::{self, BrokerLink, Subscription};
use crate::util::error::DynResult;
use chrono::{DateTime, Utc};
use log::warn;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Error {
    SubscribeFailed(broker::Error),
    QueryFailed(broker::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Error::*;
        match self {
            SubscribeFailed(e) => write!(f, "Failed to subscribe to alarm: {}", e),
            QueryFailed(e) => write!(f, "Failed to query alarm: {}", e),
        }
    }
}

/// Handlers get the pushed state and report failure through the result.
/// A failed handler is logged and skipped, the rest of the dispatch still
/// runs.
pub type AlarmCallback = Box<dyn FnMut(&Alarm) -> DynResult<()> + Send>;

enum Filter {
    AnyUpdate,
    AnyRaise,
    RaiseRange { low: u8, high: u8 },
    AnyClear,
}

struct Callback {
    filter: Filter,
    handler: AlarmCallback,
}

struct Cache {
    alarm: Alarm,
    updated: DateTime<Utc>,
}

/// Consumer side of one alarm. Keeps the last pushed state in a local
/// cache and runs registered callbacks against every push drained by
/// [`pump`](Self::pump) or [`pump_wait`](Self::pump_wait).
pub struct Listener {
    link: Arc<dyn BrokerLink>,
    name: String,
    // Taking this lock is what serializes pumps of the same listener
    subscription: AsyncMutex<Subscription>,
    cache: Mutex<Cache>,
    callbacks: Mutex<Vec<Callback>>,
    timeout: Duration,
}

impl Listener {
    /// Subscribe to `name` and seed the cache with an initial query.
    pub async fn new(link: Arc<dyn BrokerLink>, name: &str) -> Result<Listener, Error> {
        let subscription = match timeout(DEFAULT_TIMEOUT, link.subscribe(name)).await {
            Ok(res) => res.map_err(Error::SubscribeFailed)?,
            Err(_) => return Err(Error::SubscribeFailed(broker::Error::Timeout)),
        };
        let alarm = match timeout(DEFAULT_TIMEOUT, link.get(name)).await {
            Ok(res) => res.map_err(Error::QueryFailed)?,
            Err(_) => return Err(Error::QueryFailed(broker::Error::Timeout)),
        };
        Ok(Listener {
            link,
            name: name.to_string(),
            subscription: AsyncMutex::new(subscription),
            cache: Mutex::new(Cache {
                alarm,
                updated: Utc::now(),
            }),
            callbacks: Mutex::new(Vec::new()),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Last state received from the broker, by push or query. Never talks
    /// to the broker.
    pub fn get_cached_alarm(&self) -> Alarm {
        self.cache.lock().unwrap().alarm.clone()
    }

    pub fn is_raised(&self) -> bool {
        self.cache.lock().unwrap().alarm.raised
    }

    pub fn is_cleared(&self) -> bool {
        !self.is_raised()
    }

    /// When the cache last changed. Reading this never changes it.
    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.cache.lock().unwrap().updated
    }

    /// Fetch the committed state from the broker, overwrite the cache and
    /// return the fresh value.
    pub async fn query_state(&self) -> Result<Alarm, Error> {
        let alarm = match timeout(self.timeout, self.link.get(&self.name)).await {
            Ok(res) => res.map_err(Error::QueryFailed)?,
            Err(_) => return Err(Error::QueryFailed(broker::Error::Timeout)),
        };
        let mut cache = self.cache.lock().unwrap();
        cache.alarm = alarm.clone();
        cache.updated = Utc::now();
        Ok(alarm)
    }

    pub async fn query_raised(&self) -> Result<bool, Error> {
        Ok(self.query_state().await?.raised)
    }

    pub async fn query_cleared(&self) -> Result<bool, Error> {
        Ok(self.query_state().await?.cleared())
    }

    /// Whether the push subscription is still alive. Says nothing about
    /// broker data; use a query for that.
    pub fn ok(&self) -> bool {
        match self.subscription.try_lock() {
            Ok(sub) => sub.ok(),
            // A pump holds the lock, so the subscription was alive a
            // moment ago
            Err(_) => true,
        }
    }

    /// Run the handler on every push.
    pub fn add_cb<F>(&self, handler: F)
    where
        F: FnMut(&Alarm) -> DynResult<()> + Send + 'static,
    {
        self.add_filtered(Filter::AnyUpdate, Box::new(handler));
    }

    /// Run the handler on every push with the alarm raised.
    pub fn add_raise_cb<F>(&self, handler: F)
    where
        F: FnMut(&Alarm) -> DynResult<()> + Send + 'static,
    {
        self.add_filtered(Filter::AnyRaise, Box::new(handler));
    }

    /// Run the handler on raises with exactly this severity.
    pub fn add_raise_severity_cb<F>(&self, handler: F, severity: u8)
    where
        F: FnMut(&Alarm) -> DynResult<()> + Send + 'static,
    {
        self.add_raise_range_cb(handler, severity, severity);
    }

    /// Run the handler on raises with severity in `low..=high`.
    pub fn add_raise_range_cb<F>(&self, handler: F, low: u8, high: u8)
    where
        F: FnMut(&Alarm) -> DynResult<()> + Send + 'static,
    {
        self.add_filtered(Filter::RaiseRange { low, high }, Box::new(handler));
    }

    /// Run the handler on every push with the alarm cleared.
    pub fn add_clear_cb<F>(&self, handler: F)
    where
        F: FnMut(&Alarm) -> DynResult<()> + Send + 'static,
    {
        self.add_filtered(Filter::AnyClear, Box::new(handler));
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().unwrap().clear();
    }

    fn add_filtered(&self, filter: Filter, handler: AlarmCallback) {
        self.callbacks.lock().unwrap().push(Callback { filter, handler });
    }

    /// Handle every push that has already arrived, in delivery order.
    /// Returns how many were handled. Never waits.
    pub async fn pump(&self) -> usize {
        let mut subscription = self.subscription.lock().await;
        self.drain(&mut subscription)
    }

    /// Wait for the next push, then handle it and everything queued
    /// behind it. Returns how many were handled; 0 means the subscription
    /// is gone.
    pub async fn pump_wait(&self) -> usize {
        let mut subscription = self.subscription.lock().await;
        match subscription.next().await {
            Some(alarm) => {
                self.handle_push(alarm);
                1 + self.drain(&mut subscription)
            }
            None => 0,
        }
    }

    fn drain(&self, subscription: &mut Subscription) -> usize {
        let mut handled = 0;
        while let Some(alarm) = subscription.try_next() {
            self.handle_push(alarm);
            handled += 1;
        }
        handled
    }

    fn handle_push(&self, alarm: Alarm) {
        {
            let mut cache = self.cache.lock().unwrap();
            cache.alarm = alarm.clone();
            cache.updated = Utc::now();
        }
        let mut callbacks = self.callbacks.lock().unwrap();
        // Fixed category order: any-update, then the transition-specific
        // groups; registration order within each group
        Self::run_matching(&mut callbacks, &alarm, |f| {
            matches!(f, Filter::AnyUpdate)
        });
        if alarm.raised {
            Self::run_matching(&mut callbacks, &alarm, |f| {
                matches!(f, Filter::AnyRaise)
            });
            let severity = alarm.severity;
            Self::run_matching(&mut callbacks, &alarm, |f| {
                matches!(f, Filter::RaiseRange { low, high }
                         if *low <= severity && severity <= *high)
            });
        } else {
            Self::run_matching(&mut callbacks, &alarm, |f| {
                matches!(f, Filter::AnyClear)
            });
        }
    }

    fn run_matching<M>(callbacks: &mut [Callback], alarm: &Alarm, matches: M)
    where
        M: Fn(&Filter) -> bool,
    {
        for cb in callbacks.iter_mut().filter(|cb| matches(&cb.filter)) {
            if let Err(e) = (cb.handler)(alarm) {
                warn!("Alarm callback failed for '{}': {}", alarm.name(), e);
            }
        }
    }
}
