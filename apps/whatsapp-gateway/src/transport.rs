//! Socket transport to the WhatsApp bridge daemon.
//!
//! The Noise-protocol client itself is a third-party collaborator running as
//! a local bridge daemon; this module speaks JSON frames to it over one
//! WebSocket per session. Events stream in (qr, open, close, message);
//! operations go out as tagged requests matched to tagged responses.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_BUFFER: usize = 256;

/// Presence state shown to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Typing,
    Online,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Typing => "typing",
            Presence::Online => "online",
        }
    }
}

/// One inbound message as the bridge reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub remote_jid: String,
    pub message_id: String,
    #[serde(default)]
    pub text: String,
    pub from_me: bool,
    #[serde(default)]
    pub quoted_text: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Socket lifecycle and message events for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Qr { payload: String },
    Open { phone_number: String },
    Closed { logged_out: bool },
    Message(WireMessage),
}

/// Operations on a live socket.
#[async_trait]
pub trait SocketOps: Send + Sync {
    /// Sends text; returns the transport-assigned message id.
    async fn send_text(&self, remote_jid: &str, text: &str) -> Result<String>;
    async fn set_presence(&self, remote_jid: &str, presence: Presence) -> Result<()>;
    async fn react(&self, remote_jid: &str, message_id: &str, emoji: &str) -> Result<()>;
    async fn mark_read(&self, remote_jid: &str, message_id: &str) -> Result<()>;
    async fn close(&self);
}

/// A freshly connected per-session socket.
pub struct SocketHandle {
    pub events: mpsc::Receiver<SocketEvent>,
    pub ops: Arc<dyn SocketOps>,
}

/// Opens sockets; trait-shaped so session workers run against fakes in
/// tests.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    async fn connect(&self, session_id: &str, credentials_dir: &Path) -> Result<SocketHandle>;
}

// ---------------------------------------------------------------------------
// Bridge wire frames

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum OutFrame<'a> {
    Init {
        session_id: &'a str,
        state_dir: &'a str,
    },
    Send {
        tag: u64,
        remote_jid: &'a str,
        text: &'a str,
    },
    Presence {
        tag: u64,
        remote_jid: &'a str,
        presence: &'a str,
    },
    React {
        tag: u64,
        remote_jid: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    },
    Read {
        tag: u64,
        remote_jid: &'a str,
        message_id: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum InFrame {
    Qr {
        payload: String,
    },
    Open {
        phone_number: String,
    },
    Close {
        #[serde(default)]
        logged_out: bool,
    },
    Message(WireMessage),
    Response {
        tag: u64,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

struct ResponsePayload {
    ok: bool,
    message_id: Option<String>,
    error: Option<String>,
}

struct BridgeSocket {
    sink: Mutex<WsSink>,
    pending: DashMap<u64, oneshot::Sender<ResponsePayload>>,
    next_tag: AtomicU64,
}

impl BridgeSocket {
    async fn request(&self, tag: u64, frame: OutFrame<'_>) -> Result<ResponsePayload> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag, tx);
        let json = serde_json::to_string(&frame).context("encode bridge frame")?;
        {
            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Text(json.into()))
                .await
                .context("write bridge frame")?;
        }
        let payload = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.remove(&tag);
                anyhow!("bridge request timed out")
            })?
            .map_err(|_| anyhow!("bridge socket closed mid-request"))?;
        if payload.ok {
            Ok(payload)
        } else {
            Err(anyhow!(
                "bridge rejected request: {}",
                payload.error.as_deref().unwrap_or("unknown error")
            ))
        }
    }

    fn tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl SocketOps for BridgeSocket {
    async fn send_text(&self, remote_jid: &str, text: &str) -> Result<String> {
        let tag = self.tag();
        let payload = self
            .request(tag, OutFrame::Send {
                tag,
                remote_jid,
                text,
            })
            .await?;
        payload
            .message_id
            .ok_or_else(|| anyhow!("bridge send returned no message id"))
    }

    async fn set_presence(&self, remote_jid: &str, presence: Presence) -> Result<()> {
        let tag = self.tag();
        self.request(tag, OutFrame::Presence {
            tag,
            remote_jid,
            presence: presence.as_str(),
        })
        .await?;
        Ok(())
    }

    async fn react(&self, remote_jid: &str, message_id: &str, emoji: &str) -> Result<()> {
        let tag = self.tag();
        self.request(tag, OutFrame::React {
            tag,
            remote_jid,
            message_id,
            emoji,
        })
        .await?;
        Ok(())
    }

    async fn mark_read(&self, remote_jid: &str, message_id: &str) -> Result<()> {
        let tag = self.tag();
        self.request(tag, OutFrame::Read {
            tag,
            remote_jid,
            message_id,
        })
        .await?;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
    }
}

/// Production transport speaking to the bridge daemon.
pub struct BridgeTransport {
    bridge_url: String,
}

impl BridgeTransport {
    pub fn new(bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl WhatsAppTransport for BridgeTransport {
    async fn connect(&self, session_id: &str, credentials_dir: &Path) -> Result<SocketHandle> {
        let url = format!("{}/session/{}", self.bridge_url, session_id);
        let (stream, _) = connect_async(&url)
            .await
            .with_context(|| format!("connect bridge socket {url}"))?;
        let (sink, mut source) = stream.split();

        let socket = Arc::new(BridgeSocket {
            sink: Mutex::new(sink),
            pending: DashMap::new(),
            next_tag: AtomicU64::new(1),
        });

        // The bridge loads (or creates) its opaque credential state from the
        // directory we own.
        {
            let frame = OutFrame::Init {
                session_id,
                state_dir: &credentials_dir.to_string_lossy(),
            };
            let json = serde_json::to_string(&frame).context("encode init frame")?;
            let mut sink = socket.sink.lock().await;
            sink.send(WsMessage::Text(json.into()))
                .await
                .context("write init frame")?;
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let reader_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut sent_close = false;
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "bridge socket read error");
                        break;
                    }
                };
                let parsed: InFrame = match serde_json::from_str(text.as_str()) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(error = %err, "undecodable bridge frame dropped");
                        continue;
                    }
                };
                let event = match parsed {
                    InFrame::Qr { payload } => SocketEvent::Qr { payload },
                    InFrame::Open { phone_number } => SocketEvent::Open { phone_number },
                    InFrame::Close { logged_out } => {
                        sent_close = true;
                        SocketEvent::Closed { logged_out }
                    }
                    InFrame::Message(message) => SocketEvent::Message(message),
                    InFrame::Response {
                        tag,
                        ok,
                        message_id,
                        error,
                    } => {
                        if let Some((_, waiter)) = reader_socket.pending.remove(&tag) {
                            let _ = waiter.send(ResponsePayload {
                                ok,
                                message_id,
                                error,
                            });
                        }
                        continue;
                    }
                };
                let is_close = matches!(event, SocketEvent::Closed { .. });
                if events_tx.send(event).await.is_err() || is_close {
                    break;
                }
            }
            if !sent_close {
                // Stream ended without a close frame: report a reconnectable
                // closure so the session worker can back off and retry.
                let _ = events_tx
                    .send(SocketEvent::Closed { logged_out: false })
                    .await;
            }
        });

        Ok(SocketHandle {
            events: events_rx,
            ops: socket,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_decodes_bridge_frame() {
        let message: WireMessage = serde_json::from_value(serde_json::json!({
            "remoteJid": "15559999@s.whatsapp.net",
            "messageId": "ABCD",
            "text": "hello",
            "fromMe": true,
            "quotedText": null,
            "timestamp": 1764800000,
        }))
        .unwrap();
        assert_eq!(message.remote_jid, "15559999@s.whatsapp.net");
        assert!(message.from_me);
        assert!(message.quoted_text.is_none());
    }

    #[test]
    fn in_frames_are_tag_discriminated() {
        let frame: InFrame =
            serde_json::from_str(r#"{"type":"qr","payload":"2@abc"}"#).unwrap();
        assert!(matches!(frame, InFrame::Qr { .. }));

        let frame: InFrame =
            serde_json::from_str(r#"{"type":"close","loggedOut":true}"#).unwrap();
        assert!(matches!(frame, InFrame::Close { logged_out: true }));

        let frame: InFrame = serde_json::from_str(
            r#"{"type":"response","tag":4,"ok":true,"messageId":"M1"}"#,
        )
        .unwrap();
        assert!(matches!(frame, InFrame::Response { tag: 4, .. }));
    }

    #[test]
    fn out_frames_serialize_with_type_tags() {
        let json = serde_json::to_value(OutFrame::Send {
            tag: 9,
            remote_jid: "x@s.whatsapp.net",
            text: "hi",
        })
        .unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["tag"], 9);
        assert_eq!(json["remoteJid"], "x@s.whatsapp.net");
    }
}
