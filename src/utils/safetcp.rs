//! TCP bind/connect/read/write helper functions with timeout mapping.

use std::marker::Unpin;
use std::net::SocketAddr;

use serde::Serialize;
use serde::de::DeserializeOwned;

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, ToSocketAddrs};
use tokio::time::{self, Duration};

use crate::utils::TandemError;

/// Writes a message through given writable connection. Sends the encoded
/// length first, then the encoded bytes.
pub(crate) async fn send_msg<Msg, Conn>(
    conn: &mut Conn,
    msg: &Msg,
) -> Result<(), TandemError>
where
    Msg: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let msg_bytes = encode_to_vec(msg)?;
    conn.write_u64(msg_bytes.len() as u64).await?;
    conn.write_all(&msg_bytes[..]).await?;
    Ok(())
}

/// Reads a message from given readable connection.
pub(crate) async fn recv_msg<Msg, Conn>(
    conn: &mut Conn,
) -> Result<Msg, TandemError>
where
    Msg: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let msg_len = conn.read_u64().await?;
    let mut msg_buf: Vec<u8> = vec![0; msg_len as usize];
    conn.read_exact(&mut msg_buf[..]).await?;
    let msg = decode_from_slice(&msg_buf)?;
    Ok(msg)
}

/// Reads a message, giving up with `SocketTimeout` after `timeout`.
pub(crate) async fn recv_msg_timeout<Msg, Conn>(
    conn: &mut Conn,
    timeout: Duration,
) -> Result<Msg, TandemError>
where
    Msg: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    match time::timeout(timeout, recv_msg(conn)).await {
        Ok(msg) => msg,
        Err(_) => Err(TandemError::SocketTimeout),
    }
}

/// Creates a socket and connects it to `addr` within `timeout`, trying each
/// resolved address in order. Socket creation failure, connection failure,
/// and expiry of the timeout each map to their own error kind.
pub(crate) async fn connect_with_timeout(
    addr: impl ToSocketAddrs,
    timeout: Duration,
) -> Result<TcpStream, TandemError> {
    let addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|_| TandemError::CouldNotConnect)?;

    let mut last_err = TandemError::CouldNotConnect;
    for addr in addrs {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|_| TandemError::CouldNotCreateSocket)?;
        socket
            .set_nodelay(true)
            .map_err(|_| TandemError::CouldNotCreateSocket)?;

        match time::timeout(timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(_)) => last_err = TandemError::CouldNotConnect,
            Err(_) => last_err = TandemError::SocketTimeout,
        }
    }
    Err(last_err)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub async fn bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, TandemError> {
    loop {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
