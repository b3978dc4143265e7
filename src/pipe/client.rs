use super::connection::Connection;
use super::message::{
    GetAlarmParams, Message, MessageVariant, SetAlarmParams, SubscribeAlarmParams,
};
use crate::alarm::Alarm;
use crate::broker::{BrokerFuture, BrokerLink, BrokerResult, Error, Subscription};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Duration;

// Any stored name works as a liveness probe, including one never set
const PROBE_ALARM: &str = "broker_probe";

enum Request {
    Set {
        alarm: Alarm,
        reply: oneshot::Sender<BrokerResult<()>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<BrokerResult<Alarm>>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<BrokerResult<Subscription>>,
    },
}

enum PendingReply {
    Set(oneshot::Sender<BrokerResult<()>>),
    Get(oneshot::Sender<BrokerResult<Alarm>>),
    Subscribe(oneshot::Sender<BrokerResult<Subscription>>, String),
}

/// Broker transport over a Unix socket speaking the JSON line protocol.
/// A task owns the connection; requests reach it over a channel and block
/// the caller until the matching reply comes back.
pub struct PipeClient {
    req_tx: UnboundedSender<Request>,
}

impl PipeClient {
    pub async fn connect<P>(path: P) -> std::io::Result<PipeClient>
    where
        P: AsRef<Path>,
    {
        let conn = Connection::connect(path).await?;
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(client_task(conn, req_rx));
        Ok(PipeClient { req_tx })
    }

    fn request<T, F>(&self, build: F) -> BrokerFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(oneshot::Sender<BrokerResult<T>>) -> Request,
    {
        let (tx, rx) = oneshot::channel();
        let sent = self.req_tx.send(build(tx));
        Box::pin(async move {
            if sent.is_err() {
                return Err(Error::ConnectionClosed);
            }
            match rx.await {
                Ok(res) => res,
                Err(_) => Err(Error::ConnectionClosed),
            }
        })
    }
}

impl BrokerLink for PipeClient {
    fn set(&self, alarm: &Alarm) -> BrokerFuture<()> {
        let alarm = alarm.clone();
        self.request(|reply| Request::Set { alarm, reply })
    }

    fn get(&self, name: &str) -> BrokerFuture<Alarm> {
        let name = name.to_string();
        self.request(|reply| Request::Get { name, reply })
    }

    fn subscribe(&self, name: &str) -> BrokerFuture<Subscription> {
        let name = name.to_string();
        self.request(|reply| Request::Subscribe { name, reply })
    }

    fn wait_available(&self, timeout: Duration) -> BrokerFuture<()> {
        let probe = self.get(PROBE_ALARM);
        Box::pin(async move {
            match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Timeout),
            }
        })
    }
}

struct Subscriber {
    cookie: String,
    push: UnboundedSender<Alarm>,
}

async fn client_task(mut conn: Connection, mut req_rx: UnboundedReceiver<Request>) {
    let mut pending: HashMap<String, PendingReply> = HashMap::new();
    // Subscribers per alarm name; a subscriber that went away gets an
    // unsubscribe sent on its behalf
    let mut subs: HashMap<String, Vec<Subscriber>> = HashMap::new();
    loop {
        tokio::select! {
            req = req_rx.recv() => {
                match req {
                    Some(req) => {
                        if !send_request(&mut conn, req, &mut pending).await {
                            break;
                        }
                    }
                    // All client handles dropped
                    None => break
                }
            },
            msg = conn.get_message() => {
                match msg {
                    Some(msg) => {
                        handle_message(&mut conn, msg, &mut pending, &mut subs).await;
                    }
                    None => break
                }
            }
        }
    }
    debug!("Broker connection task exiting");
    // Dropping `pending` cancels the reply channels, callers see the
    // connection as closed
}

async fn send_request(
    conn: &mut Connection,
    req: Request,
    pending: &mut HashMap<String, PendingReply>,
) -> bool {
    let cookie = conn.get_cookie();
    let (variant, waiting) = match req {
        Request::Set { alarm, reply } => (
            MessageVariant::SetAlarm(SetAlarmParams { alarm }.into()),
            PendingReply::Set(reply),
        ),
        Request::Get { name, reply } => (
            MessageVariant::GetAlarm(GetAlarmParams { name }.into()),
            PendingReply::Get(reply),
        ),
        Request::Subscribe { name, reply } => (
            MessageVariant::SubscribeAlarm(SubscribeAlarmParams { name: name.clone() }.into()),
            PendingReply::Subscribe(reply, name),
        ),
    };
    let msg = Message {
        message: variant,
        client_cookie: cookie.clone(),
    };
    if let Err(e) = conn.send_message(&msg).await {
        warn!("Failed to send broker request: {}", e);
        return false;
    }
    pending.insert(cookie, waiting);
    true
}

async fn handle_message(
    conn: &mut Connection,
    msg: Message,
    pending: &mut HashMap<String, PendingReply>,
    subs: &mut HashMap<String, Vec<Subscriber>>,
) {
    let cookie = msg.client_cookie;
    let message = match msg.message {
        MessageVariant::NotifyAlarm(params) => {
            return route_push(conn, params.params.alarm, subs).await;
        }
        other => other,
    };
    let waiting = match pending.remove(&cookie) {
        Some(waiting) => waiting,
        None => {
            debug!("Reply with unknown cookie {}", cookie);
            return;
        }
    };
    match (waiting, message) {
        (PendingReply::Set(reply), MessageVariant::NotifySetAlarm) => {
            let _ = reply.send(Ok(()));
        }
        (PendingReply::Set(reply), MessageVariant::ErrorSetAlarm(e)) => {
            let _ = reply.send(Err(Error::Rejected(e.to_string())));
        }
        (PendingReply::Get(reply), MessageVariant::NotifyGetAlarm(params)) => {
            let _ = reply.send(Ok(params.params.alarm));
        }
        (PendingReply::Get(reply), MessageVariant::ErrorGetAlarm(e)) => {
            let _ = reply.send(Err(Error::Rejected(e.to_string())));
        }
        (PendingReply::Subscribe(reply, name), MessageVariant::NotifySubscribeAlarm(_)) => {
            let (push, rx) = mpsc::unbounded_channel();
            subs.entry(name)
                .or_insert_with(Vec::new)
                .push(Subscriber { cookie, push });
            let _ = reply.send(Ok(Subscription::new(rx)));
        }
        (PendingReply::Subscribe(reply, _), MessageVariant::ErrorSubscribeAlarm(e)) => {
            let _ = reply.send(Err(Error::Rejected(e.to_string())));
        }
        (_, message) => {
            warn!("Unexpected reply {:?} for cookie {}", message, cookie);
        }
    }
}

async fn route_push(
    conn: &mut Connection,
    alarm: Alarm,
    subs: &mut HashMap<String, Vec<Subscriber>>,
) {
    let mut dropped = Vec::new();
    if let Some(list) = subs.get_mut(alarm.name()) {
        list.retain(|sub| {
            if sub.push.send(alarm.clone()).is_ok() {
                true
            } else {
                dropped.push(sub.cookie.clone());
                false
            }
        });
    }
    // Subscriptions dropped on our side get unsubscribed at the broker
    for cookie in dropped {
        let msg = Message {
            message: MessageVariant::UnsubscribeAlarm,
            client_cookie: cookie,
        };
        if let Err(e) = conn.send_message(&msg).await {
            warn!("Failed to send unsubscribe: {}", e);
        }
    }
}
