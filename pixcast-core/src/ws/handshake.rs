//! HTTP/1.1 → WebSocket upgrade (RFC 6455 §4.2, RFC 7692 §5).
//!
//! ```text
//!  AwaitRequest ──► ValidateRequest ──► ComputeAccept
//!                         │                   │
//!                         ▼                   ▼
//!                     Aborted ◄──── NegotiateExtensions
//!                         ▲                   │
//!                         │                   ▼
//!                         └────────── SendResponse ──► Established
//! ```
//!
//! Any phase can abort. A rejected request gets a best-effort
//! `400 Bad Request` (or `426 Upgrade Required` for a version
//! mismatch) before the socket is dropped.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use ring::digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::deflate::{DeflateParams, EXTENSION_NAME};
use crate::error::StreamError;

/// Fixed GUID appended to the client key (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version we accept.
pub const WEBSOCKET_VERSION: &str = "13";

pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PATH: &str = "/ws";

/// Window size we always run; offers that cap it lower are declined.
const SERVER_WINDOW_BITS: u8 = 15;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

// ── HandshakePhase ───────────────────────────────────────────────

/// Progress of one upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakePhase {
    #[default]
    AwaitRequest,
    ValidateRequest,
    ComputeAccept,
    NegotiateExtensions,
    SendResponse,
    Established,
    /// Terminal failure.
    Aborted(&'static str),
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitRequest => write!(f, "AwaitRequest"),
            Self::ValidateRequest => write!(f, "ValidateRequest"),
            Self::ComputeAccept => write!(f, "ComputeAccept"),
            Self::NegotiateExtensions => write!(f, "NegotiateExtensions"),
            Self::SendResponse => write!(f, "SendResponse"),
            Self::Established => write!(f, "Established"),
            Self::Aborted(reason) => write!(f, "Aborted({reason})"),
        }
    }
}

impl HandshakePhase {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Established | Self::Aborted(_))
    }

    /// Move to the next phase in order.
    ///
    /// Fails once the handshake is established or aborted.
    pub fn advance(&mut self) -> Result<(), StreamError> {
        let next = match self {
            Self::AwaitRequest => Self::ValidateRequest,
            Self::ValidateRequest => Self::ComputeAccept,
            Self::ComputeAccept => Self::NegotiateExtensions,
            Self::NegotiateExtensions => Self::SendResponse,
            Self::SendResponse => Self::Established,
            Self::Established | Self::Aborted(_) => {
                return Err(StreamError::ProtocolViolation(
                    "cannot advance: handshake already finished",
                ));
            }
        };
        *self = next;
        Ok(())
    }

    /// Transition to `Aborted`.
    ///
    /// Valid from any non-terminal phase.
    pub fn abort(&mut self, reason: &'static str) -> Result<(), StreamError> {
        if self.is_terminal() {
            return Err(StreamError::ProtocolViolation(
                "cannot abort: handshake already finished",
            ));
        }
        *self = Self::Aborted(reason);
        Ok(())
    }
}

// ── Accept key ───────────────────────────────────────────────────

/// `base64(SHA1(key ++ GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(key.trim().as_bytes());
    ctx.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(ctx.finish().as_ref())
}

// ── Request parsing ──────────────────────────────────────────────

/// A parsed upgrade request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parse the header block (request line plus header lines).
    pub fn parse(head: &[u8]) -> Result<Self, StreamError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| StreamError::InvalidHandshake("request is not utf-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .ok_or(StreamError::InvalidHandshake("empty request"))?;
        let mut parts = request_line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(StreamError::InvalidHandshake("malformed request line"));
        };
        if !version.starts_with("HTTP/") {
            return Err(StreamError::InvalidHandshake("malformed request line"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(StreamError::InvalidHandshake("malformed header line"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        // Query strings do not affect routing.
        let path = target.split('?').next().unwrap_or(target).to_string();

        Ok(Self {
            method: method.to_string(),
            path,
            headers,
        })
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of header `name`, joined the way repeated headers
    /// combine (comma-separated).
    pub fn header_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header_joined(name).is_some_and(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }
}

// ── Extension negotiation ────────────────────────────────────────

/// Pick the first `permessage-deflate` offer we can honor.
///
/// `header` is the (joined) `Sec-WebSocket-Extensions` value.
pub fn negotiate_deflate(header: Option<&str>) -> Option<DeflateParams> {
    header?
        .split(',')
        .find_map(|offer| parse_deflate_offer(offer.trim()))
}

fn parse_deflate_offer(offer: &str) -> Option<DeflateParams> {
    let mut params = offer.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case(EXTENSION_NAME) {
        return None;
    }

    let mut accepted = DeflateParams::default();
    let mut seen: Vec<String> = Vec::with_capacity(4);
    for param in params.filter(|p| !p.is_empty()) {
        let (name, value) = match param.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (param, None),
        };
        let name = name.to_ascii_lowercase();
        // A parameter may appear at most once per offer.
        if seen.contains(&name) {
            return None;
        }
        match name.as_str() {
            "server_no_context_takeover" => accepted.server_no_context_takeover = true,
            "client_no_context_takeover" => accepted.client_no_context_takeover = true,
            "server_max_window_bits" => {
                let bits: u8 = value?.parse().ok()?;
                if bits != SERVER_WINDOW_BITS {
                    return None;
                }
                accepted.server_max_window_bits = true;
            }
            // The client may shrink its own window; our inflater always
            // runs with 15 bits, which decodes any smaller window.
            "client_max_window_bits" => {
                if let Some(v) = value {
                    let bits: u8 = v.parse().ok()?;
                    if !(8..=15).contains(&bits) {
                        return None;
                    }
                }
            }
            _ => return None,
        }
        seen.push(name);
    }
    Some(accepted)
}

// ── Responses ────────────────────────────────────────────────────

/// `101 Switching Protocols` response head.
pub fn build_response(accept: &str, deflate: Option<&DeflateParams>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(params) = deflate {
        response.push_str("Sec-WebSocket-Extensions: ");
        response.push_str(&params.response_token());
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

fn rejection(err: &StreamError) -> &'static str {
    match err {
        StreamError::UnsupportedVersion(_) => {
            "HTTP/1.1 426 Upgrade Required\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n"
        }
        _ => {
            "HTTP/1.1 400 Bad Request\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n"
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────

/// Knobs for [`accept`].
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Upgrade endpoint, e.g. `/ws`.
    pub path: String,
    pub max_header_bytes: usize,
    pub timeout: Duration,
    /// Offer permessage-deflate at all.
    pub compression: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            compression: true,
        }
    }
}

/// Result of a successful upgrade.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub path: String,
    /// Negotiated permessage-deflate parameters, if any.
    pub deflate: Option<DeflateParams>,
    /// Bytes received after the header block; the start of the frame stream.
    pub leftover: BytesMut,
}

/// Run the server side of the upgrade on `stream`.
///
/// The whole exchange is bounded by `config.timeout`.
pub async fn accept<S>(stream: &mut S, config: &HandshakeConfig) -> Result<HandshakeOutcome, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = HandshakePhase::default();
    let result = tokio::time::timeout(config.timeout, run(stream, config, &mut phase))
        .await
        .unwrap_or(Err(StreamError::Timeout(config.timeout)));

    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let _ = phase.abort(abort_reason(&err));
            debug!(%phase, error = %err, "handshake failed");
            if !matches!(err, StreamError::Timeout(_) | StreamError::Transport(_)) {
                let _ = stream.write_all(rejection(&err).as_bytes()).await;
                let _ = stream.flush().await;
            }
            Err(err)
        }
    }
}

fn abort_reason(err: &StreamError) -> &'static str {
    match err {
        StreamError::InvalidHandshake(reason) => reason,
        StreamError::UnsupportedVersion(_) => "unsupported version",
        StreamError::Timeout(_) => "timed out",
        _ => "transport failure",
    }
}

async fn run<S>(
    stream: &mut S,
    config: &HandshakeConfig,
    phase: &mut HandshakePhase,
) -> Result<HandshakeOutcome, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_head(stream, config.max_header_bytes).await?;
    phase.advance()?;

    let request = Request::parse(&head)?;
    let key = validate(&request, &config.path)?;
    phase.advance()?;

    let accept = accept_key(key);
    phase.advance()?;

    let deflate = if config.compression {
        negotiate_deflate(request.header_joined("Sec-WebSocket-Extensions").as_deref())
    } else {
        None
    };
    phase.advance()?;

    let response = build_response(&accept, deflate.as_ref());
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    phase.advance()?;

    debug!(path = %request.path, deflate = deflate.is_some(), "websocket upgrade complete");
    Ok(HandshakeOutcome {
        path: request.path,
        deflate,
        leftover,
    })
}

/// Read until the blank line; returns `(head, bytes after it)`.
async fn read_head<S>(stream: &mut S, max: usize) -> Result<(BytesMut, BytesMut), StreamError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024.min(max.max(HEADER_TERMINATOR.len())));
    let mut scanned: usize = 0;
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(StreamError::InvalidHandshake("connection closed during handshake"));
        }

        let from = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        if let Some(pos) = buf[from..]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
        {
            let end = from + pos + HEADER_TERMINATOR.len();
            if end > max {
                break;
            }
            let head = buf.split_to(end);
            return Ok((head, buf));
        }
        scanned = buf.len();
        if scanned > max {
            break;
        }
    }
    warn!(max, "request header too large");
    Err(StreamError::InvalidHandshake("request header too large"))
}

/// Check an upgrade request; returns the client key.
fn validate<'r>(request: &'r Request, path: &str) -> Result<&'r str, StreamError> {
    if request.method != "GET" {
        return Err(StreamError::InvalidHandshake("method must be GET"));
    }
    if request.path != path {
        return Err(StreamError::InvalidHandshake("unknown path"));
    }
    let upgrade = request
        .header("Upgrade")
        .ok_or(StreamError::InvalidHandshake("missing Upgrade header"))?;
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(StreamError::InvalidHandshake("Upgrade is not websocket"));
    }
    if request.header("Connection").is_some() && !request.header_has_token("Connection", "upgrade") {
        return Err(StreamError::InvalidHandshake("Connection lacks upgrade"));
    }
    match request.header("Sec-WebSocket-Version") {
        Some(WEBSOCKET_VERSION) => {}
        Some(other) => return Err(StreamError::UnsupportedVersion(other.to_string())),
        None => return Err(StreamError::InvalidHandshake("missing Sec-WebSocket-Version")),
    }
    request
        .header("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or(StreamError::InvalidHandshake("missing Sec-WebSocket-Key"))
}

// ── Tests ────────────────────────────────────────────────────────
