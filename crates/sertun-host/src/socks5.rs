//! A CONNECT-only subset of SOCKS5 (RFC 1928): version/method handshake with
//! no-auth negotiation, request parsing for the IPv4/domain/IPv6 address
//! types, and the bidirectional pipe once a Virtual Channel is live.

use std::{net::Ipv4Addr, sync::Arc};

use sertun_core::Multiplexer;
use sertun_proto::control::FrontEnd;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::CONTROL_RPC_TIMEOUT;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Accepts SOCKS5 clients on `listener` forever, spawning one task per
/// connection. Returns only if `listener.accept` itself fails.
pub async fn serve<D>(listener: TcpListener, mux: Arc<Multiplexer<D>>)
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "SOCKS5 accept failed");
                continue;
            },
        };
        let mux = Arc::clone(&mux);
        tokio::spawn(async move {
            if let Err(e) = handle(socket, mux).await {
                info!(peer = %peer, error = %e, "SOCKS5 connection ended");
            }
        });
    }
}

async fn handle<D>(mut socket: TcpStream, mux: Arc<Multiplexer<D>>) -> io::Result<()>
where
    D: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    negotiate_method(&mut socket).await?;
    let (host, port) = read_request(&mut socket).await?;

    let cancel = CancellationToken::new();
    let established = tokio::time::timeout(CONTROL_RPC_TIMEOUT, mux.establish_remote(&cancel)).await;
    let mut channel = match established {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            write_reply(&mut socket, REPLY_GENERAL_FAILURE).await?;
            return Err(io::Error::other(e));
        },
        Err(_) => {
            cancel.cancel();
            write_reply(&mut socket, REPLY_GENERAL_FAILURE).await?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Establish RPC timed out"));
        },
    };
    let cid = channel.cid();

    let connected =
        tokio::time::timeout(CONTROL_RPC_TIMEOUT, mux.rpc_connect(cid, &host, port, FrontEnd::Socks5, &cancel)).await;
    match connected {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            write_reply(&mut socket, REPLY_GENERAL_FAILURE).await?;
            return Err(io::Error::other(e));
        },
        Err(_) => {
            cancel.cancel();
            write_reply(&mut socket, REPLY_GENERAL_FAILURE).await?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Connect RPC timed out"));
        },
    }

    write_reply(&mut socket, REPLY_SUCCEEDED).await?;

    info!(host, port, cid, "SOCKS5 tunnel established");
    io::copy_bidirectional(&mut socket, &mut channel).await?;
    channel.shutdown().await
}

async fn negotiate_method<S: AsyncRead + AsyncWrite + Unpin>(socket: &mut S) -> io::Result<()> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported SOCKS version"));
    }
    let n_methods = header[1] as usize;
    let mut methods = vec![0u8; n_methods];
    socket.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        socket.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        socket.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        Err(io::Error::new(io::ErrorKind::InvalidData, "client offered no acceptable auth method"))
    }
}

async fn read_request<S: AsyncRead + AsyncWrite + Unpin>(socket: &mut S) -> io::Result<(String, u16)> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;
    if ver != VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported SOCKS version in request"));
    }
    if cmd != CMD_CONNECT {
        write_reply(socket, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(io::Error::new(io::ErrorKind::InvalidData, "only CONNECT is supported"));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            socket.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        },
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "domain is not UTF-8"))?
        },
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            socket.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        },
        other => {
            write_reply(socket, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unsupported ATYP {other}")));
        },
    };

    let mut port_bytes = [0u8; 2];
    socket.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok((host, port))
}

async fn write_reply<S: AsyncWrite + Unpin>(socket: &mut S, reply: u8) -> io::Result<()> {
    // BND.ADDR/BND.PORT are zeroed: this front-end never reports the
    // egress side's real bound address back to the client.
    socket
        .write_all(&[VERSION, reply, 0x00, ATYP_IPV4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        .await
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn negotiates_no_auth_when_client_offers_it() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();

        negotiate_method(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [VERSION, METHOD_NO_AUTH]);
    }

    #[tokio::test]
    async fn rejects_when_client_offers_no_acceptable_method() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();

        let err = negotiate_method(&mut server).await.expect_err("no acceptable method");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn reads_a_domain_request() {
        let (mut client, mut server) = duplex(256);
        let domain = b"example.com";
        let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        request.extend_from_slice(domain);
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (host, port) = read_request(&mut server).await.unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn reads_an_ipv4_request() {
        let (mut client, mut server) = duplex(64);
        let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        request.extend_from_slice(&[127, 0, 0, 1]);
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (host, port) = read_request(&mut server).await.unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn rejects_commands_other_than_connect() {
        let (mut client, mut server) = duplex(64);
        let mut request = vec![VERSION, 0x02, 0x00, ATYP_IPV4];
        request.extend_from_slice(&[0, 0, 0, 0]);
        request.extend_from_slice(&0u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let err = read_request(&mut server).await.expect_err("bind is not supported");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
