use super::connection::{self, Connection};
use super::message::{
    AlarmParams, ErrorInfo, Message, MessageVariant, SubscribeAlarmParams,
};
use crate::alarm::Alarm;
use log::{debug, error};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

pub type ReplyFn = Mutex<dyn FnMut(Message) -> Result<()> + Send>;

const ERROR_INVALID_ALARM: u32 = 1;
const ERROR_NO_SUBSCRIPTION: u32 = 4;

struct Subscriber {
    cookie: String,
    notify: Weak<ReplyFn>,
}

/// Broker state machine: committed alarm states plus per-name subscriber
/// lists. Transport-agnostic; `serve` wires it to a Unix socket.
pub struct AlarmServer {
    alarms: HashMap<String, Alarm>,
    // Maps alarm names to subscribers
    subscriptions: HashMap<String, Vec<Subscriber>>,
}

fn error_reply(variant: fn(ErrorInfo) -> MessageVariant, code: u32, desc: String, cookie: &str) -> Message {
    Message {
        message: variant(ErrorInfo {
            error_code: code,
            error_description: desc,
        }),
        client_cookie: cookie.to_string(),
    }
}

impl AlarmServer {
    pub fn new() -> AlarmServer {
        AlarmServer {
            alarms: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn set(&mut self, alarm: Alarm, cookie: &str) -> Message {
        if let Err(e) = alarm.validate() {
            return error_reply(
                MessageVariant::ErrorSetAlarm,
                ERROR_INVALID_ALARM,
                e.to_string(),
                cookie,
            );
        }
        self.alarms.insert(alarm.name().to_string(), alarm.clone());
        if let Some(subs) = self.subscriptions.get_mut(alarm.name()) {
            // Push to every live subscriber, drop the dead ones
            subs.retain(|sub| {
                let notify = match sub.notify.upgrade() {
                    Some(notify) => notify,
                    None => return false,
                };
                let push = Message {
                    message: MessageVariant::NotifyAlarm(
                        AlarmParams {
                            alarm: alarm.clone(),
                        }
                        .into(),
                    ),
                    client_cookie: sub.cookie.clone(),
                };
                let mut send = notify.lock().unwrap();
                match send(push) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Dropping subscriber {}: {}", sub.cookie, e);
                        false
                    }
                }
            });
        }
        Message {
            message: MessageVariant::NotifySetAlarm,
            client_cookie: cookie.to_string(),
        }
    }

    fn get(&self, name: &str, cookie: &str) -> Message {
        let alarm = match self.alarms.get(name) {
            Some(alarm) => alarm.clone(),
            // A name that was never set reads back as cleared
            None => match Alarm::new(name) {
                Ok(alarm) => alarm,
                Err(e) => {
                    return error_reply(
                        MessageVariant::ErrorGetAlarm,
                        ERROR_INVALID_ALARM,
                        e.to_string(),
                        cookie,
                    )
                }
            },
        };
        Message {
            message: MessageVariant::NotifyGetAlarm(AlarmParams { alarm }.into()),
            client_cookie: cookie.to_string(),
        }
    }

    fn subscribe(
        &mut self,
        params: SubscribeAlarmParams,
        cookie: &str,
        notify: Weak<ReplyFn>,
    ) -> Message {
        let current = match self.alarms.get(&params.name) {
            Some(alarm) => alarm.clone(),
            None => match Alarm::new(&params.name) {
                Ok(alarm) => alarm,
                Err(e) => {
                    return error_reply(
                        MessageVariant::ErrorSubscribeAlarm,
                        ERROR_INVALID_ALARM,
                        e.to_string(),
                        cookie,
                    )
                }
            },
        };
        self.subscriptions
            .entry(params.name)
            .or_insert_with(Vec::new)
            .push(Subscriber {
                cookie: cookie.to_string(),
                notify,
            });
        Message {
            message: MessageVariant::NotifySubscribeAlarm(AlarmParams { alarm: current }.into()),
            client_cookie: cookie.to_string(),
        }
    }

    fn unsubscribe(&mut self, cookie: &str, notify_fn: &Weak<ReplyFn>) -> Message {
        let mut found = false;
        for subs in self.subscriptions.values_mut() {
            let before = subs.len();
            // Cookies are only unique within a connection, so the
            // requesting connection has to match as well
            subs.retain(|sub| {
                !(sub.cookie == cookie && Weak::ptr_eq(&sub.notify, notify_fn))
            });
            found |= subs.len() != before;
        }
        if found {
            Message {
                message: MessageVariant::NotifyUnsubscribeAlarm,
                client_cookie: cookie.to_string(),
            }
        } else {
            error_reply(
                MessageVariant::ErrorUnsubscribeAlarm,
                ERROR_NO_SUBSCRIPTION,
                "No matching subscription".to_string(),
                cookie,
            )
        }
    }

    pub fn handle_message(&mut self, msg: Message, notify_fn: &Weak<ReplyFn>) -> Option<Message> {
        match msg.message {
            MessageVariant::SetAlarm(params) => {
                Some(self.set(params.params.alarm, &msg.client_cookie))
            }
            MessageVariant::GetAlarm(params) => {
                Some(self.get(&params.params.name, &msg.client_cookie))
            }
            MessageVariant::SubscribeAlarm(params) => {
                Some(self.subscribe(params.params, &msg.client_cookie, notify_fn.clone()))
            }
            MessageVariant::UnsubscribeAlarm => {
                Some(self.unsubscribe(&msg.client_cookie, notify_fn))
            }
            _ => None,
        }
    }
}

async fn handle_client(mut conn: Connection, server: Arc<Mutex<AlarmServer>>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let notify_fn: Arc<ReplyFn> = Arc::new(Mutex::new(move |msg| {
        tx.send(msg)
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })
    }));
    let notify_fn_weak = Arc::downgrade(&notify_fn);
    loop {
        tokio::select! {
            res = conn.get_message() => {
                match res {
                    Some(msg) => {
                        let reply = {
                            let mut server = server.lock().unwrap();
                            server.handle_message(msg, &notify_fn_weak)
                        };
                        if let Some(reply) = reply {
                            debug!("Reply: {:?}", &reply);
                            if let Err(err) = conn.send_message(&reply).await {
                                error!("Failed to send reply: {}", err);
                            }
                        }
                    },
                    None => break
                }
            },
            res = rx.recv() => {
                match res {
                    Some(notice) => {
                        if let Err(err) = conn.send_message(&notice).await {
                            error!("Failed to send push: {}", err);
                        }
                    },
                    None => break
                }
            }
        }
    }
    debug!("Connection closed");
}

/// Run a broker on a Unix socket until `shutdown` completes.
pub async fn serve<P, S>(path: P, shutdown: S) -> std::io::Result<()>
where
    P: AsRef<Path>,
    S: Future<Output = ()> + Send + 'static,
{
    let server = Arc::new(Mutex::new(AlarmServer::new()));
    connection::listen(
        path,
        move |conn| handle_client(conn, server.clone()),
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::broker::BrokerLink;
    use crate::listener::Listener;
    use crate::pipe::client::PipeClient;
    use test_log::test;
    use tokio::time::{sleep, Duration};
    use tokio_util::sync::CancellationToken;

    async fn connect_with_retry(path: &std::path::Path) -> PipeClient {
        for _ in 0..100 {
            if let Ok(client) = PipeClient::connect(path).await {
                return client;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("Broker socket never came up at {:?}", path);
    }

    #[test(tokio::test)]
    async fn round_trip_over_the_socket() {
        let path = std::env::temp_dir().join(format!("alarm_bus_test_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(path.clone(), {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        }));

        let client = Arc::new(connect_with_retry(&path).await);
        client
            .wait_available(Duration::from_secs(2))
            .await
            .unwrap();

        let listener = Listener::new(client.clone(), "pipe_alarm").await.unwrap();
        assert!(listener.ok());
        assert!(listener.is_cleared());

        let caster = Broadcaster::new(client.clone(), "pipe_alarm").unwrap();
        caster.alarm().node_name = "pipe_test".to_string();
        caster.update_severity(3).await.unwrap();

        assert_eq!(listener.pump_wait().await, 1);
        let cached = listener.get_cached_alarm();
        assert!(cached.raised);
        assert_eq!(cached.severity, 3);
        assert_eq!(cached.node_name, "pipe_test");

        // Query bypasses the cache and hits the stored state
        assert!(listener.query_raised().await.unwrap());
        assert_eq!(client.get("pipe_alarm").await.unwrap(), cached);

        caster.clear().await.unwrap();
        assert_eq!(listener.pump_wait().await, 1);
        assert!(listener.is_cleared());

        shutdown.cancel();
        let _ = server.await;
    }

    // Two connections in the same process hand out the same cookie
    // sequence, so an unsubscribe must only hit the requesting connection
    #[test(tokio::test)]
    async fn unsubscribe_is_scoped_to_the_connection() {
        let path =
            std::env::temp_dir().join(format!("alarm_bus_test_unsub_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(path.clone(), {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        }));

        let client_a = connect_with_retry(&path).await;
        let client_b = connect_with_retry(&path).await;

        // First request on each connection, cookies collide
        let sub_a = client_a.subscribe("alpha").await.unwrap();
        let mut sub_b = client_b.subscribe("beta").await.unwrap();
        drop(sub_a);

        // The push for this set makes the first connection notice the
        // dropped subscription and unsubscribe it at the broker
        let alpha = Alarm::with_fields("alpha", true, "unsub_test", "", "", 1).unwrap();
        client_a.set(&alpha).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let beta = Alarm::with_fields("beta", true, "unsub_test", "", "", 2).unwrap();
        client_b.set(&beta).await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(2), sub_b.next())
            .await
            .expect("Push for unrelated subscription never arrived")
            .unwrap();
        assert_eq!(pushed, beta);

        shutdown.cancel();
        let _ = server.await;
    }

    #[test(tokio::test)]
    async fn invalid_set_is_rejected_over_the_socket() {
        let path =
            std::env::temp_dir().join(format!("alarm_bus_test_bad_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(path.clone(), {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        }));

        let client = connect_with_retry(&path).await;
        let mut bad = crate::alarm::Alarm::new("a").unwrap();
        bad.severity = 42;
        assert!(matches!(
            client.set(&bad).await,
            Err(crate::broker::Error::Rejected(_))
        ));

        shutdown.cancel();
        let _ = server.await;
    }
}
