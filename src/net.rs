use crate::error::WireError;
use crate::handlers;
use crate::messages::{Address, RingMessage};
use crate::Shared;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, error, info, warn};

// file lists ride along on every ping, so frames are bounded but generous
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

// writes one length-prefixed frame
pub(crate) async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(payload.len(), MAX_FRAME_SIZE));
    }
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

// reads one length-prefixed frame
pub(crate) async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(len, MAX_FRAME_SIZE));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(buffer)
}

pub(crate) async fn send_msg<W>(stream: &mut W, msg: &RingMessage) -> Result<(), WireError>
where
    W: AsyncWriteExt + Unpin,
{
    write_frame(stream, &msg.encode()?).await
}

pub(crate) async fn recv_msg<R>(stream: &mut R) -> Result<RingMessage, WireError>
where
    R: AsyncReadExt + Unpin,
{
    RingMessage::decode(&read_frame(stream).await?)
}

pub(crate) async fn connect(to: &Address) -> Result<TcpStream> {
    let stream = TcpStream::connect((to.host.as_str(), to.port))
        .await
        .with_context(|| format!("connecting to {}", to))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Opens a connection, sends one message and closes it.
pub(crate) async fn notify(to: &Address, msg: &RingMessage) -> Result<()> {
    let mut stream = connect(to).await?;
    send_msg(&mut stream, msg)
        .await
        .with_context(|| format!("sending {} to {}", msg.kind(), to))?;
    Ok(())
}

/// Opens a connection, sends one message and waits for the single reply.
pub(crate) async fn request(to: &Address, msg: &RingMessage) -> Result<RingMessage> {
    let mut stream = connect(to).await?;
    send_msg(&mut stream, msg)
        .await
        .with_context(|| format!("sending {} to {}", msg.kind(), to))?;
    let reply = recv_msg(&mut stream)
        .await
        .with_context(|| format!("waiting for reply to {} from {}", msg.kind(), to))?;
    Ok(reply)
}

/// Accepts connections until the node stops, one handler task per connection.
/// Returning drops the listener, so later connects are refused.
pub(crate) async fn serve(s: Arc<Shared>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("[{}] Accepted connection from {}", s.me, peer);
                        let _ = stream.set_nodelay(true);
                        let s = s.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handlers::handle_connection(&s, stream).await {
                                warn!("[{}] Handler for {} failed: {:#}", s.me, peer, e);
                            }
                        });
                    }
                    Err(e) => error!("[{}] Accept failed: {}", s.me, e),
                }
            }
        }
    }
    info!("[{}] Shutting down listener", s.me);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_is_length_prefixed() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = RingMessage::Get {
            filename: "f1".into(),
            sender: Address::new("127.0.0.1", 7),
        };
        send_msg(&mut a, &msg).await.unwrap();

        let mut len = [0u8; 4];
        b.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        b.read_exact(&mut body).await.unwrap();
        assert_eq!(RingMessage::decode(&body).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_recv_after_send() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = RingMessage::Ping {
            files: vec!["x".into()],
            sender: Address::new("h", 1),
        };
        send_msg(&mut a, &msg).await.unwrap();
        assert_eq!(recv_msg(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let announced = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&announced).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::TooLarge(_, MAX_FRAME_SIZE))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(WireError::Io(_))));
    }
}
