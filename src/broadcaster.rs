use crate::alarm::{Alarm, InvalidAlarm, MAX_SEVERITY};
use crate::broker::{self, BrokerLink};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{timeout, Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Error {
    PublishFailed(broker::Error),
    Invalid(InvalidAlarm),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Error::*;
        match self {
            PublishFailed(e) => write!(f, "Failed to publish alarm: {}", e),
            Invalid(e) => write!(f, "Invalid alarm state: {}", e),
        }
    }
}

/// Producer side of one alarm. Holds the alarm state either privately or
/// through a handle shared with the caller; either way, whatever the state
/// looks like at publish time is what the broker gets.
pub struct Broadcaster {
    link: Arc<dyn BrokerLink>,
    alarm: Arc<Mutex<Alarm>>,
    timeout: Duration,
}

impl Broadcaster {
    /// Broadcaster with its own private copy of the state, starting out
    /// cleared.
    pub fn new(link: Arc<dyn BrokerLink>, name: &str) -> Result<Broadcaster, InvalidAlarm> {
        let alarm = Alarm::new(name)?;
        Ok(Self::with_shared(link, Arc::new(Mutex::new(alarm))))
    }

    /// Broadcaster bound to a caller-owned state. Mutations through the
    /// caller's handle and through [`alarm()`](Self::alarm) land on the
    /// same value.
    pub fn with_shared(link: Arc<dyn BrokerLink>, alarm: Arc<Mutex<Alarm>>) -> Broadcaster {
        Broadcaster {
            link,
            alarm,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Direct access to the alarm state. Field changes made through the
    /// guard are picked up by the next publish; nothing is sent here.
    pub fn alarm(&self) -> MutexGuard<'_, Alarm> {
        self.alarm.lock().unwrap()
    }

    pub fn shared_alarm(&self) -> Arc<Mutex<Alarm>> {
        self.alarm.clone()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Commit the current state to the broker. Blocks until the broker
    /// acknowledges or the per-call timeout expires; on failure the local
    /// state is left as it was and the broker is not assumed updated.
    pub async fn publish(&self) -> Result<(), Error> {
        let alarm = self.alarm.lock().unwrap().clone();
        alarm.validate().map_err(Error::Invalid)?;
        debug!("Publishing {}", alarm);
        match timeout(self.timeout, self.link.set(&alarm)).await {
            Ok(res) => res.map_err(Error::PublishFailed),
            Err(_) => Err(Error::PublishFailed(broker::Error::Timeout)),
        }
    }

    /// Raise the alarm and commit.
    pub async fn raise(&self) -> Result<(), Error> {
        self.alarm.lock().unwrap().raised = true;
        self.publish().await
    }

    /// Clear the alarm and commit.
    pub async fn clear(&self) -> Result<(), Error> {
        self.alarm.lock().unwrap().raised = false;
        self.publish().await
    }

    /// Set the severity and commit. Asserting a severity is asserting a
    /// problem, so this raises as well; the broker sees a single commit.
    pub async fn update_severity(&self, severity: u8) -> Result<(), Error> {
        if severity > MAX_SEVERITY {
            return Err(Error::Invalid(InvalidAlarm::SeverityOutOfRange(severity)));
        }
        {
            let mut alarm = self.alarm.lock().unwrap();
            alarm.severity = severity;
            alarm.raised = true;
        }
        self.publish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_broker::MemoryBroker;

    #[tokio::test]
    async fn publish_commits_current_state() {
        let broker = MemoryBroker::new();
        let caster = Broadcaster::new(broker.clone(), "test_alarm").unwrap();
        caster.alarm().problem_description = "overheated".to_string();
        caster.alarm().severity = 2;
        caster.publish().await.unwrap();

        let stored = broker.get("test_alarm").await.unwrap();
        assert_eq!(stored.problem_description, "overheated");
        assert_eq!(stored.severity, 2);
        assert!(!stored.raised);
    }

    #[tokio::test]
    async fn raise_and_clear_publish() {
        let broker = MemoryBroker::new();
        let caster = Broadcaster::new(broker.clone(), "test_alarm").unwrap();
        caster.raise().await.unwrap();
        assert!(broker.get("test_alarm").await.unwrap().raised);
        caster.clear().await.unwrap();
        assert!(broker.get("test_alarm").await.unwrap().cleared());
    }

    #[tokio::test]
    async fn update_severity_raises_in_one_commit() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("test_alarm").await.unwrap();
        let caster = Broadcaster::new(broker.clone(), "test_alarm").unwrap();
        caster.update_severity(4).await.unwrap();

        let pushed = sub.try_next().unwrap();
        assert!(pushed.raised);
        assert_eq!(pushed.severity, 4);
        // Exactly one push for the whole operation
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn update_severity_rejects_out_of_range() {
        let broker = MemoryBroker::new();
        let caster = Broadcaster::new(broker.clone(), "test_alarm").unwrap();
        assert!(matches!(
            caster.update_severity(MAX_SEVERITY + 1).await,
            Err(Error::Invalid(InvalidAlarm::SeverityOutOfRange(_)))
        ));
        // Local state untouched by the failed call
        assert_eq!(caster.alarm().severity, 0);
        assert!(!caster.alarm().raised);
    }

    #[tokio::test]
    async fn shared_state_is_visible_to_publish() {
        let broker = MemoryBroker::new();
        let shared = Arc::new(Mutex::new(Alarm::new("test_alarm").unwrap()));
        let caster = Broadcaster::with_shared(broker.clone(), shared.clone());

        shared.lock().unwrap().severity = 3;
        caster.alarm().raised = true;
        let outside = shared.lock().unwrap().clone();
        assert_eq!(outside, caster.alarm().clone());

        caster.publish().await.unwrap();
        let stored = broker.get("test_alarm").await.unwrap();
        assert_eq!(stored.severity, 3);
        assert!(stored.raised);
    }
}
