//! Transport layer: length-prefixed frames over TCP.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! bytes. The transport never looks inside the bytes. Outbound traffic is
//! connection-per-message: [`connect_and_send`] opens a fresh connection,
//! writes one frame, optionally reads one reply frame, and closes.

use crate::error::{FrameError, SendPhase, WireError};
use crate::message::{decode_message, encode_message, Message};
use qnet_types::config::TransportConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Bind the listening socket.
pub async fn listen(bind_address: SocketAddr) -> Result<TcpListener, WireError> {
    TcpListener::bind(bind_address)
        .await
        .map_err(|source| WireError::Bind {
            addr: bind_address,
            source,
        })
}

/// Read one frame and return its payload bytes.
///
/// The declared length is checked against `max_len` before anything is
/// allocated for the body.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > max_len {
        return Err(FrameError::TooLarge {
            size: u64::from(len),
            max: max_len,
        });
    }

    let mut body = Vec::with_capacity(len as usize);
    reader.take(u64::from(len)).read_to_end(&mut body).await?;
    if body.len() != len as usize {
        return Err(FrameError::Truncated {
            expected: len,
            received: body.len(),
        });
    }
    Ok(body)
}

/// Write one frame. Either the whole frame is written and flushed, or the
/// connection should be treated as failed.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        size: payload.len() as u64,
        max: u32::MAX,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as a [`Message`].
pub async fn read_message<R>(reader: &mut R, max_len: u32) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader, max_len).await?;
    Ok(decode_message(&body)?)
}

/// Encode a [`Message`] and write it as one frame.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    write_frame(writer, &bytes).await?;
    Ok(())
}

/// Open a connection, send one message, optionally read one reply, close.
///
/// Connect, write and read are each bounded by the timeouts in `config`.
/// When `expect_reply` is set and the peer closes without answering, the
/// result is `Ok(None)`.
pub async fn connect_and_send(
    addr: SocketAddr,
    msg: &Message,
    expect_reply: bool,
    config: &TransportConfig,
) -> Result<Option<Message>, WireError> {
    let mut stream = with_timeout(
        addr,
        SendPhase::Connect,
        config.connect_timeout(),
        async { TcpStream::connect(addr).await.map_err(WireError::from) },
    )
    .await?;

    with_timeout(addr, SendPhase::Write, config.write_timeout(), async {
        write_message(&mut stream, msg).await
    })
    .await?;

    debug!(
        peer = %addr,
        message_id = %msg.message_id,
        message_type = %msg.message_type(),
        "Frame sent"
    );

    if !expect_reply {
        let _ = stream.shutdown().await;
        return Ok(None);
    }

    let reply = with_timeout(addr, SendPhase::Read, config.read_timeout(), async {
        match read_message(&mut stream, config.max_frame_len).await {
            Ok(reply) => Ok(Some(reply)),
            Err(WireError::Frame(FrameError::ConnectionClosed)) => Ok(None),
            Err(e) => Err(e),
        }
    })
    .await?;
    Ok(reply)
}

async fn with_timeout<T, F>(
    addr: SocketAddr,
    phase: SendPhase,
    limit: Duration,
    fut: F,
) -> Result<T, WireError>
where
    F: std::future::Future<Output = Result<T, WireError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(WireError::SendTimeout { addr, phase }),
    }
}
