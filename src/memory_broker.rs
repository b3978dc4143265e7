use crate::alarm::Alarm;
use crate::broker::{BrokerFuture, BrokerLink, BrokerResult, Error, Subscription};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Duration;

struct Inner {
    alarms: HashMap<String, Alarm>,
    // Push channels per alarm name, pruned when a subscriber goes away
    subscribers: HashMap<String, Vec<UnboundedSender<Alarm>>>,
}

/// A broker that lives inside the process. Commits states to a map and
/// pushes them to subscribers directly, so broadcasters and listeners can
/// be wired up without any transport underneath.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker {
            inner: Mutex::new(Inner {
                alarms: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        })
    }

    fn commit(&self, alarm: &Alarm) -> BrokerResult<()> {
        if let Err(e) = alarm.validate() {
            return Err(Error::Rejected(e.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .alarms
            .insert(alarm.name().to_string(), alarm.clone());
        if let Some(subs) = inner.subscribers.get_mut(alarm.name()) {
            // Pushes happen under the lock, so every subscriber sees
            // commits in the same order they were acknowledged
            subs.retain(|tx| tx.send(alarm.clone()).is_ok());
        }
        debug!("Committed {}", alarm);
        Ok(())
    }

    fn current(&self, name: &str) -> BrokerResult<Alarm> {
        let inner = self.inner.lock().unwrap();
        match inner.alarms.get(name) {
            Some(alarm) => Ok(alarm.clone()),
            None => Alarm::new(name).map_err(|e| Error::Rejected(e.to_string())),
        }
    }

    fn add_subscriber(&self, name: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .entry(name.to_string())
            .or_insert_with(Vec::new)
            .push(tx);
        Subscription::new(rx)
    }
}

impl BrokerLink for MemoryBroker {
    fn set(&self, alarm: &Alarm) -> BrokerFuture<()> {
        let res = self.commit(alarm);
        Box::pin(async move { res })
    }

    fn get(&self, name: &str) -> BrokerFuture<Alarm> {
        let res = self.current(name);
        Box::pin(async move { res })
    }

    fn subscribe(&self, name: &str) -> BrokerFuture<Subscription> {
        let subscription = self.add_subscriber(name);
        Box::pin(async move { Ok(subscription) })
    }

    fn wait_available(&self, _timeout: Duration) -> BrokerFuture<()> {
        // Always reachable, it's in the same process
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_of_unknown_name_is_default() {
        let broker = MemoryBroker::new();
        let alarm = broker.get("never_set").await.unwrap();
        assert_eq!(alarm, Alarm::new("never_set").unwrap());
    }

    #[tokio::test]
    async fn set_pushes_to_subscribers() {
        let broker = MemoryBroker::new();
        let mut sub1 = broker.subscribe("a").await.unwrap();
        let mut sub2 = broker.subscribe("a").await.unwrap();
        let mut other = broker.subscribe("b").await.unwrap();

        let alarm = Alarm::with_fields("a", true, "n", "", "", 2).unwrap();
        broker.set(&alarm).await.unwrap();

        assert_eq!(sub1.try_next(), Some(alarm.clone()));
        assert_eq!(sub2.try_next(), Some(alarm.clone()));
        assert_eq!(sub1.try_next(), None);
        assert_eq!(other.try_next(), None);
        assert_eq!(broker.get("a").await.unwrap(), alarm);
    }

    #[tokio::test]
    async fn invalid_set_is_rejected() {
        let broker = MemoryBroker::new();
        let mut bad = Alarm::new("a").unwrap();
        bad.severity = 17;
        assert!(matches!(
            broker.set(&bad).await,
            Err(Error::Rejected(_))
        ));
        // Nothing committed
        assert_eq!(broker.get("a").await.unwrap(), Alarm::new("a").unwrap());
    }
}
