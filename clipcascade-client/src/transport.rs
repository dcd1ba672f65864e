use std::time::Duration;

use futures::{
    SinkExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::COOKIE},
    },
};
use tracing::debug;

use crate::SessionError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsWrite = SplitSink<WsStream, Message>;
pub(crate) type WsRead = SplitStream<WsStream>;

/// Opens a WebSocket carrying the login session cookie, giving up at `deadline`.
pub(crate) async fn open_socket(
    url: &str,
    cookie: Option<&str>,
    deadline: Instant,
    timeout: Duration,
) -> Result<WsStream, SessionError> {
    let mut request = url
        .into_client_request()
        .map_err(|err| SessionError::Transport(format!("invalid url {url}: {err}")))?;
    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|err| SessionError::Transport(format!("invalid cookie header: {err}")))?;
        request.headers_mut().insert(COOKIE, value);
    }

    match timeout_at(deadline, connect_async(request)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(err)) => Err(SessionError::Transport(format!("connect to {url} failed: {err}"))),
        Err(_) => Err(SessionError::ConnectTimeout {
            url: url.to_owned(),
            timeout,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Keepalive {
    /// STOMP heart-beat: a bare end-of-line every ten seconds.
    StompHeartbeat,
    Ping,
}

impl Keepalive {
    fn interval(self) -> Duration {
        match self {
            Self::StompHeartbeat => Duration::from_secs(10),
            Self::Ping => Duration::from_secs(30),
        }
    }

    fn message(self) -> Message {
        match self {
            Self::StompHeartbeat => Message::Text("\n".into()),
            Self::Ping => Message::Ping(Vec::new().into()),
        }
    }
}

/// Owns the write half. Dropping every sender closes the socket.
pub(crate) fn spawn_writer(
    mut write: WsWrite,
    keepalive: Keepalive,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive.interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                next = outbound_rx.recv() => {
                    match next {
                        Some(text) => {
                            if let Err(err) = write.send(Message::Text(text.into())).await {
                                debug!("websocket send failed: {}", err);
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if write.send(keepalive.message()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (outbound_tx, task)
}
