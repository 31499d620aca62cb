use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Cap on request/response head size while scanning for CRLFCRLF.
pub const MAX_HEAD_BYTES: usize = 256 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Headers that apply to a single transport leg and never cross a proxy.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version_minor: u8,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn host_header(&self) -> Option<&str> {
        header_value(&self.headers, "host")
    }

    /// Path component used for rule scoping; strips scheme and authority from
    /// absolute-form targets.
    pub fn path(&self) -> &str {
        let t = self.target.as_str();
        for scheme in ["http://", "https://"] {
            if let Some(rest) = t.strip_prefix(scheme) {
                return rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
            }
        }
        t
    }
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.is(name))
        .map(|h| h.value.as_str())
}

pub fn remove_header(headers: &mut Vec<Header>, name: &str) {
    headers.retain(|h| !h.is(name));
}

pub fn set_header(headers: &mut Vec<Header>, name: &str, value: &str) {
    remove_header(headers, name);
    headers.push(Header::new(name, value));
}

pub fn strip_hop_by_hop(headers: &mut Vec<Header>) {
    headers.retain(|h| {
        let lname = h.name.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&lname.as_str())
    });
}

/// `Connection: close` (or HTTP/1.0 without keep-alive) terminates the
/// persistent loop after the current exchange.
pub fn wants_close(version_minor: u8, headers: &[Header]) -> bool {
    let conn = header_value(headers, "connection").unwrap_or("");
    let has_token = |token: &str| {
        conn.split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if has_token("close") {
        return true;
    }
    version_minor == 0 && !has_token("keep-alive")
}

/// Content-Type with parameters stripped, lowercased.
pub fn content_type_essence(headers: &[Header]) -> Option<String> {
    header_value(headers, "content-type").map(|v| {
        v.split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    })
}

/// The buffer-or-stream predicate's content-type half.
pub fn is_text_like(essence: &str) -> bool {
    essence.starts_with("text/")
        || matches!(
            essence,
            "application/json" | "application/javascript" | "application/xml"
        )
}

pub fn is_chunked(headers: &[Header]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

pub fn content_length(headers: &[Header]) -> Result<Option<u64>, ProxyError> {
    match header_value(headers, "content-length") {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProxyError::Http(format!("invalid Content-Length `{v}`"))),
    }
}

/// `host[:port]` splitter with a scheme-appropriate default.
pub fn split_host_port(hostport: &str, default_port: u16) -> (String, u16) {
    match hostport.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (hostport.to_string(), default_port),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    UntilEof,
}

pub fn request_body_framing(head: &RequestHead) -> Result<BodyFraming, ProxyError> {
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(&head.headers)? {
        Some(0) | None => Ok(BodyFraming::None),
        Some(n) => Ok(BodyFraming::ContentLength(n)),
    }
}

pub fn response_body_framing(
    req_method: &str,
    head: &ResponseHead,
) -> Result<BodyFraming, ProxyError> {
    if req_method.eq_ignore_ascii_case("HEAD")
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyFraming::None);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(&head.headers)? {
        Some(0) => Ok(BodyFraming::None),
        Some(n) => Ok(BodyFraming::ContentLength(n)),
        None => Ok(BodyFraming::UntilEof),
    }
}

pub fn encode_request_head(head: &RequestHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, head.target).as_bytes());
    for h in &head.headers {
        out.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let reason = if head.reason.is_empty() {
        default_reason(head.status)
    } else {
        head.reason.as_str()
    };
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", head.status, reason).as_bytes());
    for h in &head.headers {
        out.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn default_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// Canned plain-text response used for proxy-originated errors.
pub async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        default_reason(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// Outcome of a capped body read.
pub enum BodyRead {
    /// Entire body decoded within the cap.
    Complete(Vec<u8>),
    /// Cap crossed; the prefix is decoded, the rest is still on the wire.
    Overflow(Vec<u8>),
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

#[derive(Debug)]
enum BodyState {
    Done,
    Length(u64),
    Chunked(ChunkPhase),
    Eof,
}

/// Opaque decode position inside a partially read body; produced by
/// [`H1Conn::read_body_capped`] and consumed by [`H1Conn::relay_remainder`].
#[derive(Debug)]
pub struct BodyProgress(BodyState);

impl BodyProgress {
    /// Progress at the start of an unread body.
    pub fn start(framing: &BodyFraming) -> Self {
        Self(match framing {
            BodyFraming::None => BodyState::Done,
            BodyFraming::ContentLength(n) => BodyState::Length(*n),
            BodyFraming::Chunked => BodyState::Chunked(ChunkPhase::Size),
            BodyFraming::UntilEof => BodyState::Eof,
        })
    }
}

/// One side of an HTTP/1.1 exchange: a stream plus the leftover bytes read
/// past the last parsed boundary.
pub struct H1Conn<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> H1Conn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Starts the parser with bytes that were already consumed from the
    /// socket (transparent-listener replay).
    pub fn with_leftover(stream: S, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            buf: leftover,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Hands back the stream plus any bytes read past the last parsed
    /// boundary (pipelined data after a CONNECT head).
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        let mut tmp = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut tmp).await?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// Reads until a full head is buffered. Returns None on clean EOF before
    /// any byte of a new message.
    async fn fill_head(&mut self) -> Result<Option<usize>, ProxyError> {
        loop {
            if let Some(pos) = memmem::find(&self.buf, b"\r\n\r\n") {
                return Ok(Some(pos + 4));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Http("head exceeds size cap".into()));
            }
            let n = self.fill().await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Http("connection closed mid-head".into()));
            }
        }
    }

    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        let head_len = match self.fill_head().await? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut headers = [httparse::EMPTY_HEADER; 256];
        let mut req = httparse::Request::new(&mut headers);
        let parsed = req
            .parse(&self.buf[..head_len])
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        if !parsed.is_complete() {
            return Err(ProxyError::Http("incomplete request head".into()));
        }
        let head = RequestHead {
            method: req
                .method
                .ok_or_else(|| ProxyError::Http("missing method".into()))?
                .to_string(),
            target: req
                .path
                .ok_or_else(|| ProxyError::Http("missing request target".into()))?
                .to_string(),
            version_minor: req.version.unwrap_or(1) as u8,
            headers: req
                .headers
                .iter()
                .map(|h| Header {
                    name: h.name.to_string(),
                    value: String::from_utf8_lossy(h.value).trim().to_string(),
                })
                .collect(),
        };
        self.buf.drain(..head_len);
        Ok(Some(head))
    }

    pub async fn read_response_head(&mut self) -> Result<ResponseHead, ProxyError> {
        let head_len = match self.fill_head().await? {
            Some(len) => len,
            None => return Err(ProxyError::Http("upstream closed before response head".into())),
        };
        let mut headers = [httparse::EMPTY_HEADER; 256];
        let mut resp = httparse::Response::new(&mut headers);
        let parsed = resp
            .parse(&self.buf[..head_len])
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        if !parsed.is_complete() {
            return Err(ProxyError::Http("incomplete response head".into()));
        }
        let head = ResponseHead {
            status: resp
                .code
                .ok_or_else(|| ProxyError::Http("missing status code".into()))?,
            reason: resp.reason.unwrap_or("").to_string(),
            version_minor: resp.version.unwrap_or(1) as u8,
            headers: resp
                .headers
                .iter()
                .map(|h| Header {
                    name: h.name.to_string(),
                    value: String::from_utf8_lossy(h.value).trim().to_string(),
                })
                .collect(),
        };
        self.buf.drain(..head_len);
        Ok(head)
    }

    fn body_state(framing: &BodyFraming) -> BodyState {
        BodyProgress::start(framing).0
    }

    /// Next decoded piece of the body, or None once the body is finished.
    async fn next_piece(&mut self, state: &mut BodyState) -> Result<Option<Vec<u8>>, ProxyError> {
        loop {
            match state {
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    if *remaining == 0 {
                        *state = BodyState::Done;
                        return Ok(None);
                    }
                    if self.buf.is_empty() {
                        let n = self.fill().await?;
                        if n == 0 {
                            return Err(ProxyError::Http("connection closed mid-body".into()));
                        }
                    }
                    let take = (self.buf.len() as u64).min(*remaining) as usize;
                    let piece: Vec<u8> = self.buf.drain(..take).collect();
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *state = BodyState::Done;
                    }
                    return Ok(Some(piece));
                }
                BodyState::Eof => {
                    if self.buf.is_empty() {
                        let n = self.fill().await?;
                        if n == 0 {
                            *state = BodyState::Done;
                            return Ok(None);
                        }
                    }
                    let piece: Vec<u8> = self.buf.drain(..).collect();
                    return Ok(Some(piece));
                }
                BodyState::Chunked(phase) => match phase {
                    ChunkPhase::Size => {
                        let Some(pos) = memmem::find(&self.buf, b"\r\n") else {
                            if self.buf.len() > 4096 {
                                return Err(ProxyError::Http("chunk size line too long".into()));
                            }
                            let n = self.fill().await?;
                            if n == 0 {
                                return Err(ProxyError::Http(
                                    "connection closed mid-chunked-body".into(),
                                ));
                            }
                            continue;
                        };
                        let line = String::from_utf8_lossy(&self.buf[..pos]).to_string();
                        self.buf.drain(..pos + 2);
                        let size_part = line.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_part, 16).map_err(|_| {
                            ProxyError::Http(format!("invalid chunk size `{size_part}`"))
                        })?;
                        if size == 0 {
                            *phase = ChunkPhase::Trailers;
                        } else {
                            *phase = ChunkPhase::Data(size);
                        }
                    }
                    ChunkPhase::Data(remaining) => {
                        if self.buf.is_empty() {
                            let n = self.fill().await?;
                            if n == 0 {
                                return Err(ProxyError::Http(
                                    "connection closed mid-chunk".into(),
                                ));
                            }
                        }
                        let take = (self.buf.len() as u64).min(*remaining) as usize;
                        let piece: Vec<u8> = self.buf.drain(..take).collect();
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *phase = ChunkPhase::DataCrlf;
                        }
                        return Ok(Some(piece));
                    }
                    ChunkPhase::DataCrlf => {
                        while self.buf.len() < 2 {
                            let n = self.fill().await?;
                            if n == 0 {
                                return Err(ProxyError::Http(
                                    "connection closed before chunk terminator".into(),
                                ));
                            }
                        }
                        if &self.buf[..2] != b"\r\n" {
                            return Err(ProxyError::Http("missing chunk terminator".into()));
                        }
                        self.buf.drain(..2);
                        *phase = ChunkPhase::Size;
                    }
                    ChunkPhase::Trailers => {
                        let Some(pos) = memmem::find(&self.buf, b"\r\n") else {
                            let n = self.fill().await?;
                            if n == 0 {
                                return Err(ProxyError::Http(
                                    "connection closed in trailers".into(),
                                ));
                            }
                            continue;
                        };
                        let empty = pos == 0;
                        self.buf.drain(..pos + 2);
                        if empty {
                            *state = BodyState::Done;
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }

    /// Fully buffers a body (request side: bodies are forwarded whole).
    pub async fn read_body(&mut self, framing: &BodyFraming) -> Result<Vec<u8>, ProxyError> {
        let mut state = Self::body_state(framing);
        let mut out = Vec::new();
        while let Some(piece) = self.next_piece(&mut state).await? {
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Buffers up to `cap` decoded bytes; crossing the cap abandons buffering
    /// and hands the prefix back for pass-through streaming.
    pub async fn read_body_capped(
        &mut self,
        framing: &BodyFraming,
        cap: usize,
    ) -> Result<(BodyRead, BodyProgress), ProxyError> {
        let mut state = Self::body_state(framing);
        let mut out = Vec::new();
        loop {
            match self.next_piece(&mut state).await? {
                None => return Ok((BodyRead::Complete(out), BodyProgress(state))),
                Some(piece) => {
                    out.extend_from_slice(&piece);
                    if out.len() > cap {
                        return Ok((BodyRead::Overflow(out), BodyProgress(state)));
                    }
                }
            }
        }
    }

    pub async fn write_request(
        &mut self,
        head: &RequestHead,
        body: &[u8],
    ) -> Result<(), ProxyError> {
        let bytes = encode_request_head(head);
        self.stream.write_all(&bytes).await?;
        if !body.is_empty() {
            self.stream.write_all(body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_response_head(&mut self, head: &ResponseHead) -> Result<(), ProxyError> {
        let bytes = encode_response_head(head);
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_chunk(&mut self, piece: &[u8]) -> Result<(), ProxyError> {
        if piece.is_empty() {
            return Ok(());
        }
        self.stream
            .write_all(format!("{:x}\r\n", piece.len()).as_bytes())
            .await?;
        self.stream.write_all(piece).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    pub async fn write_chunked_end(&mut self) -> Result<(), ProxyError> {
        self.stream.write_all(b"0\r\n\r\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Streams the remainder of a partially read body from this side to the
    /// peer, preserving wire framing on the peer side (re-chunking when the
    /// original body was chunked).
    pub async fn relay_remainder<T: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        progress: BodyProgress,
        chunked_out: bool,
        peer: &mut H1Conn<T>,
    ) -> Result<(), ProxyError> {
        let mut state = progress.0;
        while let Some(piece) = self.next_piece(&mut state).await? {
            if chunked_out {
                peer.write_chunk(&piece).await?;
            } else {
                peer.write_raw(&piece).await?;
            }
            peer.flush().await?;
        }
        if chunked_out {
            peer.write_chunked_end().await?;
        }
        peer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Cursor<Vec<u8>> implements AsyncRead + AsyncWrite in tokio.
    fn conn(data: &[u8]) -> H1Conn<Cursor<Vec<u8>>> {
        H1Conn::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn parses_request_head_and_body() {
        let mut c = conn(b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nabcd");
        let head = c.read_request_head().await.expect("ok").expect("some");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/submit");
        assert_eq!(head.host_header(), Some("example.com"));
        let framing = request_body_framing(&head).expect("framing");
        assert_eq!(framing, BodyFraming::ContentLength(4));
        let body = c.read_body(&framing).await.expect("body");
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut c = conn(b"");
        assert!(c.read_request_head().await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn head_split_across_reads_is_reassembled() {
        // Cursor returns everything at once, so emulate the split with
        // leftover bytes plus the remaining stream.
        let mut c = H1Conn::with_leftover(
            Cursor::new(b"nt-Length: 3\r\n\r\nxyz".to_vec()),
            b"HTTP/1.1 200 OK\r\nConte".to_vec(),
        );
        let head = c.read_response_head().await.expect("head");
        assert_eq!(head.status, 200);
        let framing = response_body_framing("GET", &head).expect("framing");
        let body = c.read_body(&framing).await.expect("body");
        assert_eq!(body, b"xyz");
    }

    #[tokio::test]
    async fn decodes_chunked_bodies_with_trailers() {
        let mut c = conn(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n");
        let head = c.read_response_head().await.expect("head");
        let framing = response_body_framing("GET", &head).expect("framing");
        assert_eq!(framing, BodyFraming::Chunked);
        let body = c.read_body(&framing).await.expect("body");
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn eof_terminated_response_reads_to_end() {
        let mut c = conn(b"HTTP/1.1 200 OK\r\n\r\nstream until close");
        let head = c.read_response_head().await.expect("head");
        let framing = response_body_framing("GET", &head).expect("framing");
        assert_eq!(framing, BodyFraming::UntilEof);
        let body = c.read_body(&framing).await.expect("body");
        assert_eq!(body, b"stream until close");
    }

    #[tokio::test]
    async fn head_and_204_have_no_body() {
        let mut c = conn(b"HTTP/1.1 204 No Content\r\n\r\n");
        let head = c.read_response_head().await.expect("head");
        assert_eq!(
            response_body_framing("GET", &head).expect("framing"),
            BodyFraming::None
        );
        let mut c = conn(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let head = c.read_response_head().await.expect("head");
        assert_eq!(
            response_body_framing("HEAD", &head).expect("framing"),
            BodyFraming::None
        );
    }

    #[tokio::test]
    async fn capped_read_reports_overflow() {
        let mut c = conn(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nabcdefgh");
        let head = c.read_response_head().await.expect("head");
        let framing = response_body_framing("GET", &head).expect("framing");
        let (read, _state) = c.read_body_capped(&framing, 4).await.expect("capped");
        match read {
            BodyRead::Overflow(prefix) => assert!(prefix.len() > 4),
            BodyRead::Complete(_) => panic!("expected overflow"),
        }
    }

    #[tokio::test]
    async fn body_exactly_at_cap_is_complete() {
        let mut c = conn(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nabcd");
        let head = c.read_response_head().await.expect("head");
        let framing = response_body_framing("GET", &head).expect("framing");
        let (read, _state) = c.read_body_capped(&framing, 4).await.expect("capped");
        assert!(matches!(read, BodyRead::Complete(b) if b == b"abcd"));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = vec![
            Header::new("Connection", "keep-alive"),
            Header::new("Proxy-Connection", "keep-alive"),
            Header::new("Keep-Alive", "timeout=5"),
            Header::new("Transfer-Encoding", "chunked"),
            Header::new("TE", "trailers"),
            Header::new("Trailer", "X-T"),
            Header::new("Upgrade", "h2c"),
            Header::new("Host", "example.com"),
        ];
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers[0].is("host"));
    }

    #[test]
    fn connection_close_semantics() {
        assert!(wants_close(1, &[Header::new("Connection", "close")]));
        assert!(!wants_close(1, &[]));
        assert!(wants_close(0, &[]));
        assert!(!wants_close(0, &[Header::new("Connection", "Keep-Alive")]));
    }

    #[test]
    fn content_type_essence_strips_parameters() {
        let headers = vec![Header::new("Content-Type", "Text/HTML; charset=UTF-8")];
        assert_eq!(content_type_essence(&headers).as_deref(), Some("text/html"));
        assert!(is_text_like("text/html"));
        assert!(is_text_like("application/json"));
        assert!(!is_text_like("image/png"));
        assert!(!is_text_like("application/octet-stream"));
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("example.com:8443", 443), ("example.com".into(), 8443));
        assert_eq!(split_host_port("example.com", 443), ("example.com".into(), 443));
    }

    #[test]
    fn absolute_target_path_extraction() {
        let head = RequestHead {
            method: "GET".into(),
            target: "http://example.com/a/b?q=1".into(),
            version_minor: 1,
            headers: vec![],
        };
        assert_eq!(head.path(), "/a/b?q=1");
        let bare = RequestHead {
            method: "GET".into(),
            target: "http://example.com".into(),
            version_minor: 1,
            headers: vec![],
        };
        assert_eq!(bare.path(), "/");
    }
}
