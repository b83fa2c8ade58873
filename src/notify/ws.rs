//! WebSocket transport for the notification hub
//!
//! The upgrade is negotiated by hyper; after the 101 response the connection is
//! split into a reader task and a writer loop speaking a minimal RFC 6455 framing.
//! Only single-frame and fragmented text messages, ping, pong and close are
//! understood. Inbound messages are capped at [`READ_LIMIT`] bytes.

use super::hub::{NotificationHub, Slot};
use crate::body::{empty, ProxyBody};
use crate::error::ErrorKind;
use base64::Engine;
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// WebSocket magic GUID for handshake
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest inbound message accepted from a client
pub const READ_LIMIT: usize = 512;
/// A client that sends nothing (not even a pong) for this long is dropped
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping period; must be shorter than PONG_WAIT
const PING_PERIOD: Duration = Duration::from_secs(54);
const WRITE_WAIT: Duration = Duration::from_secs(10);

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Compute the Sec-WebSocket-Accept header value
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Check if a request is asking for a WebSocket upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let header_has = |name: hyper::header::HeaderName, token: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains(token))
            .unwrap_or(false)
    };
    header_has(UPGRADE, "websocket") && header_has(CONNECTION, "upgrade")
}

/// Answer an upgrade request and attach the connection to `slot` once upgraded
pub fn upgrade<B>(mut req: Request<B>, hub: Arc<NotificationHub>, slot: Slot) -> Response<ProxyBody>
where
    B: Send + 'static,
{
    let key = match req.headers().get(SEC_WEBSOCKET_KEY).and_then(|v| v.to_str().ok()) {
        Some(key) if is_upgrade_request(&req) => key.to_string(),
        _ => {
            return crate::error::json_error_response(
                ErrorKind::InvalidInput,
                "expected a WebSocket upgrade",
            )
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve(TokioIo::new(upgraded), hub, slot).await,
            Err(e) => warn!(slot = slot.as_str(), "WebSocket upgrade failed: {}", e),
        }
    });

    let accept = HeaderValue::from_str(&accept_key(&key))
        .unwrap_or_else(|_| HeaderValue::from_static(""));
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty())
        .expect("valid response with static status and headers")
}

/// Control frames the reader asks the writer to send
enum Control {
    Pong(Vec<u8>),
    Close(u16),
}

/// Pump messages between an upgraded connection and a hub slot until either side quits
pub async fn serve<S>(stream: S, hub: Arc<NotificationHub>, slot: Slot)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (client_id, mut outbound) = hub.attach(slot);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    let read_hub = Arc::clone(&hub);
    let read_pump = tokio::spawn(async move {
        read_loop(&mut reader, &read_hub, slot, control_tx).await;
    });

    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    loop {
        let frame = tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => encode_frame(OP_TEXT, text.as_bytes(), None),
                None => {
                    let _ = write_frame(&mut writer, &close_frame(1000)).await;
                    break;
                }
            },
            control = control_rx.recv() => match control {
                Some(Control::Pong(payload)) => encode_frame(OP_PONG, &payload, None),
                Some(Control::Close(code)) => {
                    let _ = write_frame(&mut writer, &close_frame(code)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => encode_frame(OP_PING, &[], None),
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(slot = slot.as_str(), "WebSocket write failed: {}", e);
            break;
        }
    }

    read_pump.abort();
    hub.detach(slot, client_id);
}

async fn read_loop<R>(
    reader: &mut R,
    hub: &NotificationHub,
    slot: Slot,
    control: mpsc::UnboundedSender<Control>,
) where
    R: AsyncRead + Unpin,
{
    let mut deadline = Instant::now() + PONG_WAIT;
    let mut message: Vec<u8> = Vec::new();

    loop {
        let frame = match tokio::time::timeout_at(deadline, read_frame(reader, READ_LIMIT)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(slot = slot.as_str(), "Closing WebSocket: {}", e);
                let _ = control.send(Control::Close(1009));
                return;
            }
            Ok(Err(e)) => {
                debug!(slot = slot.as_str(), "WebSocket read ended: {}", e);
                return;
            }
            Err(_) => {
                info!(slot = slot.as_str(), "WebSocket client missed its pong deadline");
                return;
            }
        };

        match frame.opcode {
            OP_TEXT | OP_BINARY | OP_CONTINUATION => {
                message.extend_from_slice(&frame.payload);
                if message.len() > READ_LIMIT {
                    warn!(slot = slot.as_str(), "Closing WebSocket: message over read limit");
                    let _ = control.send(Control::Close(1009));
                    return;
                }
                if !frame.fin {
                    continue;
                }
                let text = String::from_utf8_lossy(&message).into_owned();
                message.clear();
                match slot {
                    Slot::Interactive => hub.handle_incoming(&text),
                    Slot::Progress => debug!("Ignoring message on progress socket"),
                }
            }
            OP_PING => {
                let _ = control.send(Control::Pong(frame.payload));
            }
            OP_PONG => {
                deadline = Instant::now() + PONG_WAIT;
            }
            OP_CLOSE => {
                let _ = control.send(Control::Close(1000));
                return;
            }
            other => {
                debug!(opcode = other, "Ignoring unknown WebSocket opcode");
            }
        }
    }
}

/// One decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Read and unmask a single frame; payloads above `limit` yield `InvalidData`
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = (header[0] & 0x80) != 0;
    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut payload_len = (header[1] & 0x7F) as u64;

    if payload_len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        payload_len = u16::from_be_bytes(ext) as u64;
    } else if payload_len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        payload_len = u64::from_be_bytes(ext);
    }

    if payload_len > limit as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {payload_len} bytes exceeds limit of {limit}"),
        ));
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Encode a final frame; server frames go out unmasked, client frames pass a mask
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | opcode);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        frame.push(mask_bit | payload.len() as u8);
    } else if payload.len() < 65536 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    match mask {
        Some(mask) => {
            frame.extend_from_slice(&mask);
            frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

fn close_frame(code: u16) -> Vec<u8> {
    encode_frame(OP_CLOSE, &code.to_be_bytes(), None)
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(WRITE_WAIT, writer.write_all(frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
    }
}
