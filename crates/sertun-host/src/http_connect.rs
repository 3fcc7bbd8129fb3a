//! HTTP CONNECT tunneling: read the request line and headers up to the
//! blank line, parse `CONNECT host:port HTTP/1.1`, establish a tunnel, then
//! pipe bytes bidirectionally.

use std::sync::Arc;

use sertun_core::Multiplexer;
use sertun_proto::control::FrontEnd;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::CONTROL_RPC_TIMEOUT;

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

/// Accepts HTTP-CONNECT clients on `listener` forever, spawning one task per
/// connection. Returns only if `listener.accept` itself fails.
pub async fn serve<D>(listener: TcpListener, mux: Arc<Multiplexer<D>>)
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "HTTP-CONNECT accept failed");
                continue;
            },
        };
        let mux = Arc::clone(&mux);
        tokio::spawn(async move {
            if let Err(e) = handle(socket, mux).await {
                info!(peer = %peer, error = %e, "HTTP-CONNECT connection ended");
            }
        });
    }
}

async fn handle<D>(socket: TcpStream, mux: Arc<Multiplexer<D>>) -> io::Result<()>
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(socket);
    let (host, port) = match read_connect_request(&mut reader).await? {
        Some(target) => target,
        None => {
            reader.get_mut().write_all(BAD_REQUEST).await?;
            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT request"));
        },
    };

    let cancel = CancellationToken::new();
    let established = tokio::time::timeout(CONTROL_RPC_TIMEOUT, mux.establish_remote(&cancel)).await;
    let mut channel = match established {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            reader.get_mut().write_all(BAD_GATEWAY).await?;
            return Err(io::Error::other(e));
        },
        Err(_) => {
            cancel.cancel();
            reader.get_mut().write_all(GATEWAY_TIMEOUT).await?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Establish RPC timed out"));
        },
    };
    let cid = channel.cid();

    let connected = tokio::time::timeout(
        CONTROL_RPC_TIMEOUT,
        mux.rpc_connect(cid, &host, port, FrontEnd::HttpConnect, &cancel),
    )
    .await;
    match connected {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            reader.get_mut().write_all(BAD_GATEWAY).await?;
            return Err(io::Error::other(e));
        },
        Err(_) => {
            cancel.cancel();
            reader.get_mut().write_all(GATEWAY_TIMEOUT).await?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Connect RPC timed out"));
        },
    }

    reader.get_mut().write_all(OK_RESPONSE).await?;

    info!(host, port, cid, "HTTP-CONNECT tunnel established");
    io::copy_bidirectional(&mut reader, &mut channel).await?;
    channel.shutdown().await
}

/// Reads the request line and headers up to the blank line, returning the
/// `(host, port)` pair from a `CONNECT` request line, or `None` if the
/// request is not a well-formed CONNECT.
async fn read_connect_request<R>(reader: &mut BufReader<R>) -> io::Result<Option<(String, u16)>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let target = match parse_connect_line(&request_line) {
        Some(target) => target,
        None => return Ok(None),
    };

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    Ok(Some(target))
}

fn parse_connect_line(line: &str) -> Option<(String, u16)> {
    let mut parts = line.trim_end().split(' ');
    let method = parts.next()?;
    if !method.eq_ignore_ascii_case("CONNECT") {
        return None;
    }
    let authority = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[test]
    fn parses_a_well_formed_connect_line() {
        assert_eq!(parse_connect_line("CONNECT example.com:443 HTTP/1.1\r\n"), Some(("example.com".to_owned(), 443)));
    }

    #[test]
    fn rejects_non_connect_methods() {
        assert_eq!(parse_connect_line("GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn rejects_missing_port() {
        assert_eq!(parse_connect_line("CONNECT example.com HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn reads_target_past_trailing_headers() {
        let (mut client, server) = duplex(256);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let target = read_connect_request(&mut reader).await.unwrap();
        assert_eq!(target, Some(("example.com".to_owned(), 443)));
    }

    #[tokio::test]
    async fn rejects_a_non_connect_request_line() {
        let (mut client, server) = duplex(256);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let target = read_connect_request(&mut reader).await.unwrap();
        assert_eq!(target, None);
    }
}
