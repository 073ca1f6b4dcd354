//! Transport seam between the connection manager and the wire
//!
//! A `Connector` opens one session per call: it completes the broker
//! handshake and hands back a pair of channels. Dropping the outgoing sender
//! closes the session; the incoming side ends with `TransportEvent::Closed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{Command, Frame};

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + 'a>>;

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    /// The session ended. Carries the reason when one is known.
    Closed(Option<String>),
}

/// One live session with the broker.
pub struct TransportSession {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens broker sessions.
///
/// Uses `Pin<Box<dyn Future>>` instead of `async fn` so the trait is
/// dyn-compatible and the manager can hold `Arc<dyn Connector>`.
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_>;
}

pub type HeaderFuture = Pin<Box<dyn Future<Output = Vec<(String, String)>> + Send>>;

/// Extra `CONNECT` headers, built fresh for every attempt so a refreshed
/// token is picked up on reconnect.
pub type HeaderSource = Arc<dyn Fn() -> HeaderFuture + Send + Sync>;

/// STOMP over WebSocket.
pub struct WebSocketConnector {
    url: String,
    host: String,
    handshake_timeout: Duration,
    headers: HeaderSource,
}

impl WebSocketConnector {
    pub fn new(url: &str, handshake_timeout: Duration) -> Result<Self> {
        let rest = url
            .strip_prefix("ws://")
            .or_else(|| url.strip_prefix("wss://"))
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: scheme must be ws or wss")))?;
        let host = rest
            .split(['/', '?'])
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing host")))?;
        let host = host.split(':').next().unwrap_or(host).to_string();

        Ok(Self {
            url: url.to_string(),
            host,
            handshake_timeout,
            headers: Arc::new(|| -> HeaderFuture { Box::pin(async { Vec::new() }) }),
        })
    }

    pub fn with_headers(mut self, headers: HeaderSource) -> Self {
        self.headers = headers;
        self
    }

    async fn open(&self) -> Result<TransportSession> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let connect = Frame::connect(&self.host, (self.headers)().await);
        write
            .send(WsMessage::text(connect.encode()))
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;

        // Wait for CONNECTED, skipping heart-beats
        loop {
            let message = read
                .next()
                .await
                .ok_or(Error::Closed)?
                .map_err(|e| Error::Connect(e.to_string()))?;
            let Some(text) = message_text(message) else {
                continue;
            };
            match Frame::decode(&text)? {
                Some(frame) if frame.command == Command::Connected => {
                    debug!(version = frame.get("version"), "broker handshake complete");
                    break;
                }
                Some(frame) if frame.command == Command::Error => {
                    let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                    return Err(Error::Rejected(reason));
                }
                Some(frame) => {
                    return Err(Error::Protocol(format!(
                        "expected CONNECTED, got {}",
                        frame.command.as_str()
                    )));
                }
                None => continue,
            }
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Reader: socket -> incoming events
        let reader_tx = in_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Close(close))) => {
                        break close.map(|c| c.reason.as_str().to_string());
                    }
                    Some(Ok(message)) => {
                        let Some(text) = message_text(message) else {
                            continue;
                        };
                        match Frame::decode(&text) {
                            Ok(Some(frame)) => {
                                if reader_tx.send(TransportEvent::Frame(frame)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable frame");
                                metrics::counter!("realtime_frames_dropped_total", "reason" => "codec")
                                    .increment(1);
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = reader_tx.send(TransportEvent::Closed(reason));
        });

        // Writer: outgoing frames -> socket; ends when every sender is dropped
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::text(frame.encode())).await {
                    warn!(error = %e, "realtime send failed");
                    let _ = in_tx.send(TransportEvent::Closed(Some(e.to_string())));
                    return;
                }
            }
            let _ = write.close().await;
            debug!("realtime writer closed");
        });

        Ok(TransportSession {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            info!(url = %self.url, "opening realtime transport");
            tokio::time::timeout(self.handshake_timeout, self.open())
                .await
                .map_err(|_| Error::HandshakeTimeout)?
        })
    }
}

fn message_text(message: WsMessage) -> Option<String> {
    match message {
        WsMessage::Text(text) => Some(text.as_str().to_string()),
        WsMessage::Binary(data) => Some(String::from_utf8_lossy(&data).into_owned()),
        _ => None,
    }
}
