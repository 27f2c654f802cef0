//! Record framing over TCP byte streams and WebSocket text frames

use std::fmt;
use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::constants::{END_OF_MESSAGE, HEADER_CONTENT_LENGTH, MAX_BODY_SIZE};
use crate::error::{EslError, EslResult};
use crate::response::{parse_header_line, Headers, RawResponse};

/// Wire protocol for a connection or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Protocol {
    /// Raw TCP byte stream, the classic `mod_event_socket` wire.
    #[default]
    Tcpsocket,
    /// WebSocket text frames, one record per frame.
    Websocket,
}

/// Address family restriction when resolving dial or listen addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Network {
    /// Any family.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

/// Unified WebSocket stream type for both dialed and accepted sockets.
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of a transport: yields one parsed record per call.
pub(crate) enum TransportRx {
    Tcp(BufReader<OwnedReadHalf>),
    Ws(SplitStream<WsStream>),
}

/// Write half of a transport: frames and sends one request per call.
pub(crate) enum TransportTx {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WsStream, Message>),
}

/// Split a TCP stream into transport halves.
pub(crate) fn split_tcp(stream: TcpStream) -> (TransportRx, TransportTx) {
    let (read_half, write_half) = stream.into_split();
    (
        TransportRx::Tcp(BufReader::new(read_half)),
        TransportTx::Tcp(write_half),
    )
}

/// Split an upgraded WebSocket stream into transport halves.
pub(crate) fn split_ws(stream: WsStream) -> (TransportRx, TransportTx) {
    let (sink, stream) = stream.split();
    (TransportRx::Ws(stream), TransportTx::Ws(sink))
}

/// Resolve and dial `address`, honoring the family restriction.
pub(crate) async fn dial_tcp(network: Network, address: &str) -> EslResult<TcpStream> {
    let mut last_err: Option<std::io::Error> = None;
    for addr in tokio::net::lookup_host(address)
        .await?
        .filter(|a| network.matches(a))
    {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => EslError::protocol(format!("no {network} addresses resolved for {address}")),
    })
}

/// Resolve and bind a listener on `address`, honoring the family restriction.
pub(crate) async fn bind_tcp(network: Network, address: &str) -> EslResult<TcpListener> {
    let mut last_err: Option<std::io::Error> = None;
    for addr in tokio::net::lookup_host(address)
        .await?
        .filter(|a| network.matches(a))
    {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => EslError::protocol(format!("no {network} addresses resolved for {address}")),
    })
}

impl TransportRx {
    /// Read exactly one record: a MIME header block terminated by a blank
    /// line, then `Content-Length` bytes of body (absent or zero means no
    /// body). Blocks until a complete record arrives or the transport fails.
    pub(crate) async fn read_response(&mut self) -> EslResult<RawResponse> {
        match self {
            TransportRx::Tcp(reader) => read_stream_record(reader).await,
            TransportRx::Ws(stream) => loop {
                let message = stream
                    .next()
                    .await
                    .ok_or(EslError::ConnectionClosed)??;
                match message {
                    Message::Text(text) => return decode_record(&text),
                    Message::Close(_) => return Err(EslError::ConnectionClosed),
                    Message::Binary(_) => {
                        return Err(EslError::protocol("binary frames are not supported"))
                    }
                    // Control frames carry no records.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            },
        }
    }
}

impl TransportTx {
    /// Frame and send one request. The record terminator is appended here;
    /// commands build their text without it.
    pub(crate) async fn write(&mut self, message: &str) -> EslResult<()> {
        let framed = format!("{message}{END_OF_MESSAGE}");
        match self {
            TransportTx::Tcp(writer) => {
                writer
                    .write_all(framed.as_bytes())
                    .await?;
                writer
                    .flush()
                    .await?;
                Ok(())
            }
            TransportTx::Ws(sink) => {
                sink.send(Message::Text(framed.into()))
                    .await?;
                Ok(())
            }
        }
    }

    /// Close the write side: FIN on TCP, a Close frame on WebSocket.
    /// Pending peer reads unblock with EOF / a close notification.
    pub(crate) async fn close(&mut self) -> EslResult<()> {
        match self {
            TransportTx::Tcp(writer) => {
                writer
                    .shutdown()
                    .await?;
                Ok(())
            }
            TransportTx::Ws(sink) => {
                let _ = sink
                    .send(Message::Close(None))
                    .await;
                sink.close()
                    .await?;
                Ok(())
            }
        }
    }
}

/// Byte-stream framing: header lines up to a blank line, then the body.
async fn read_stream_record(reader: &mut BufReader<OwnedReadHalf>) -> EslResult<RawResponse> {
    let mut headers = Headers::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(EslError::ConnectionClosed);
        }
        let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if trimmed.is_empty() {
            // Stray blank lines between records are skipped; a blank line
            // after at least one header ends the block.
            if headers.is_empty() {
                continue;
            }
            break;
        }
        let (name, value) = parse_header_line(trimmed)?;
        headers.add(&name, value);
    }

    let length = content_length(&headers)?;
    let body = if length > 0 {
        let mut body = vec![0u8; length];
        reader
            .read_exact(&mut body)
            .await?;
        body
    } else {
        Vec::new()
    };
    Ok(RawResponse::new(headers, body))
}

/// Message framing: one complete record per text frame.
fn decode_record(text: &str) -> EslResult<RawResponse> {
    let mut headers = Headers::new();
    let mut pos = 0;
    while pos < text.len() {
        let (line, next) = match text[pos..].find('\n') {
            Some(offset) => (&text[pos..pos + offset], pos + offset + 1),
            None => (&text[pos..], text.len()),
        };
        let line = line.trim_end_matches('\r');
        pos = next;
        if line.is_empty() {
            if headers.is_empty() {
                continue;
            }
            break;
        }
        let (name, value) = parse_header_line(line)?;
        headers.add(&name, value);
    }

    let length = content_length(&headers)?;
    let remainder = &text.as_bytes()[pos..];
    if remainder.len() < length {
        return Err(EslError::protocol(format!(
            "record body shorter than Content-Length: {} < {}",
            remainder.len(),
            length
        )));
    }
    Ok(RawResponse::new(headers, remainder[..length].to_vec()))
}

fn content_length(headers: &Headers) -> EslResult<usize> {
    let Some(raw) = headers.get(HEADER_CONTENT_LENGTH) else {
        return Ok(0);
    };
    let length: usize = raw
        .trim()
        .parse()
        .map_err(|_| EslError::protocol(format!("invalid Content-Length: {raw}")))?;
    if length > MAX_BODY_SIZE {
        return Err(EslError::protocol(format!(
            "Content-Length {length} exceeds limit {MAX_BODY_SIZE}"
        )));
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_record_headers_only() {
        let record = decode_record("Content-Type: auth/request\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(record.content_type(), "auth/request");
        assert!(record
            .body()
            .is_empty());
    }

    #[test]
    fn test_decode_record_with_body() {
        let record = decode_record(
            "Content-Type: api/response\r\nContent-Length: 9\r\nUnique-Id: call-1\r\n\r\nconnected\r\n\r\n",
        )
        .unwrap();
        assert_eq!(record.content_type(), "api/response");
        assert_eq!(record.header("Unique-Id"), Some("call-1"));
        // Trailing terminator bytes beyond Content-Length are ignored.
        assert_eq!(record.body_str(), Some("connected"));
    }

    #[test]
    fn test_decode_record_short_body() {
        let result = decode_record("Content-Type: api/response\r\nContent-Length: 50\r\n\r\nshort");
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_record_bad_content_length() {
        assert!(decode_record("Content-Type: api/response\nContent-Length: abc\n\n").is_err());
        assert!(decode_record(&format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_BODY_SIZE + 1
        ))
        .is_err());
    }

    #[test]
    fn test_decode_record_malformed_header() {
        assert!(decode_record("not a header\n\n").is_err());
    }

    #[tokio::test]
    async fn test_stream_record_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener
                .accept()
                .await
                .unwrap();
            peer.write_all(
                b"Content-Type: command/reply\r\nReply-Text: +OK accepted\r\n\r\n\
                  Content-Type: api/response\r\nContent-Length: 9\r\n\r\nconnected",
            )
            .await
            .unwrap();
        });

        let stream = TcpStream::connect(addr)
            .await
            .unwrap();
        let (mut rx, _tx) = split_tcp(stream);

        let first = rx
            .read_response()
            .await
            .unwrap();
        assert_eq!(first.content_type(), "command/reply");
        assert_eq!(first.reply_text(), Some("+OK accepted"));

        let second = rx
            .read_response()
            .await
            .unwrap();
        assert_eq!(second.content_type(), "api/response");
        assert_eq!(second.body_str(), Some("connected"));

        server
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_write_appends_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr)
                .await
                .unwrap();
            let (_rx, mut tx) = split_tcp(stream);
            tx.write("auth ClueCon")
                .await
                .unwrap();
            tx.close()
                .await
                .unwrap();
        });

        let (mut peer, _) = listener
            .accept()
            .await
            .unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received)
            .await
            .unwrap();
        assert_eq!(received, b"auth ClueCon\r\n\r\n");

        client
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_eof_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();

        let stream = TcpStream::connect(addr)
            .await
            .unwrap();
        let (mut rx, _tx) = split_tcp(stream);
        drop(
            listener
                .accept()
                .await
                .unwrap(),
        );

        let err = rx
            .read_response()
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed));
    }

    #[test]
    fn test_network_matches() {
        let v4: SocketAddr = "127.0.0.1:8021"
            .parse()
            .unwrap();
        let v6: SocketAddr = "[::1]:8021"
            .parse()
            .unwrap();
        assert!(Network::Tcp.matches(&v4) && Network::Tcp.matches(&v6));
        assert!(Network::Tcp4.matches(&v4) && !Network::Tcp4.matches(&v6));
        assert!(!Network::Tcp6.matches(&v4) && Network::Tcp6.matches(&v6));
    }
}
