use super::message::Message;
use log::{debug, error, warn};
use std::fs::{create_dir_all, remove_file};
use std::future::Future;
use std::path::Path;
use std::process;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::pin;
use tokio::sync::mpsc::{self, Receiver, Sender};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// One end of a broker connection: a write half plus a channel fed by a
/// reader task that parses one JSON message per line.
pub struct Connection {
    stream: OwnedWriteHalf,
    cookie_prefix: String,
    cookie_count: u32,
    messages: Receiver<Message>,
}

async fn read_connection<R>(r: R, send: Sender<Message>)
where
    R: AsyncRead + Unpin,
{
    let mut r = BufReader::new(r);
    loop {
        let mut line = String::new();
        match r.read_line(&mut line).await {
            Err(e) => {
                error!("Failed to read line from pipe: {}", e);
                break;
            }
            Ok(l) => {
                if l == 0 {
                    break;
                }
                debug!("Got line: {}", line);
                match serde_json::from_str(&line) {
                    Err(e) => {
                        error!("Failed to parse message: {}", e);
                    }
                    Ok(msg) => {
                        if send.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn send_cmd(stream: &mut OwnedWriteHalf, cmd: &Message) -> Result<()> {
    let mut cmd_bytes = serde_json::to_vec(cmd)?;
    cmd_bytes.push(b'\n');
    stream.write_all(&cmd_bytes).await?;
    stream.flush().await?;
    Ok(())
}

impl Connection {
    pub async fn connect<P>(path: P) -> std::io::Result<Connection>
    where
        P: AsRef<Path>,
    {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    pub(crate) fn from_stream(stream: UnixStream) -> Connection {
        let (r, w) = stream.into_split();
        let (msg_in, msg_out) = mpsc::channel(10);
        tokio::spawn(read_connection(r, msg_in));
        Connection {
            stream: w,
            cookie_prefix: format!("cookie_{}_", process::id()),
            cookie_count: 0,
            messages: msg_out,
        }
    }

    /// Cookies are unique per connection and correlate replies with
    /// requests.
    pub fn get_cookie(&mut self) -> String {
        self.cookie_count = self.cookie_count.wrapping_add(1);
        self.cookie_prefix.clone() + &self.cookie_count.to_string()
    }

    /// Next incoming message. None means the peer is gone.
    pub async fn get_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    pub async fn send_message(&mut self, msg: &Message) -> Result<()> {
        send_cmd(&mut self.stream, msg).await
    }
}

/// Accept connections on a Unix socket and run `handler` for each, until
/// `shutdown` completes.
pub async fn listen<P, H, F, S>(path: P, handler: H, shutdown: S) -> std::io::Result<()>
where
    H: Fn(Connection) -> F,
    F: Future<Output = ()> + Send + 'static,
    P: AsRef<Path>,
    S: Future<Output = ()> + Send + 'static,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path.as_ref())?;
    pin!(shutdown);
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _addr) = res?;
                let conn = Connection::from_stream(stream);
                tokio::spawn(handler(conn));
            },
            _ = (&mut shutdown) => break
        }
    }

    if let Err(e) = remove_file(path.as_ref()) {
        warn!(
            "Failed to delete socket {}: {}",
            path.as_ref().to_string_lossy(),
            e
        );
    }
    Ok(())
}
