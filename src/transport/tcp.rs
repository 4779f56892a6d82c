use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{timeout, Duration};

use crate::config::{IO_TIMEOUT, MAX_FRAME_SIZE};
use crate::error::LinkError;
use crate::protocol::Message;
use crate::transport::Transport;

/// Length-prefixed JSON frames over a TCP stream.
///
/// Each frame is a 4-byte big-endian payload length followed by the JSON
/// encoding of one [`Message`]. Incoming bytes are buffered so a cancelled
/// `recv` never loses part of a frame.
pub struct TcpTransport {
    stream: TcpStream,
    timeout_duration: Duration,
    max_frame_size: u32,
    buffer: Vec<u8>,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_config(stream, IO_TIMEOUT, MAX_FRAME_SIZE)
    }

    pub fn with_config(stream: TcpStream, timeout_duration: Duration, max_frame_size: u32) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream,
            timeout_duration,
            max_frame_size,
            buffer: Vec::new(),
            peer,
        }
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("Connect timeout after {:?}", IO_TIMEOUT))??;
        Ok(Self::new(stream))
    }

    /// Pop one complete frame off the receive buffer, if there is one.
    fn take_frame(&mut self) -> anyhow::Result<Option<Message>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        if len == 0 {
            return Err(anyhow::anyhow!("Invalid message length: 0"));
        }
        if len > self.max_frame_size {
            return Err(anyhow::anyhow!(
                "Message too large: {} bytes (max: {})",
                len,
                self.max_frame_size
            ));
        }
        let end = 4 + len as usize;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let msg = Message::decode(&self.buffer[4..end])
            .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e));
        self.buffer.drain(..end);
        msg.map(Some)
    }
}

/// Encode `value` as one length-prefixed JSON frame. Failures are
/// [`LinkError`]s: nothing was written and the stream is still usable.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_size: u32) -> anyhow::Result<Vec<u8>> {
    let data = serde_json::to_vec(value).map_err(|e| LinkError::Encode(e.to_string()))?;
    if data.len() as u64 > max_frame_size as u64 {
        return Err(LinkError::TooLarge {
            size: data.len(),
            max: max_frame_size,
        }
        .into());
    }
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Read exactly one frame. Unlike [`TcpTransport::recv`] this is not cancel
/// safe; it is meant for request/response exchanges.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: u32) -> anyhow::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(read_error)?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(anyhow::anyhow!("Invalid message length: 0"));
    }
    if len > max_frame_size {
        return Err(anyhow::anyhow!(
            "Message too large: {} bytes (max: {})",
            len,
            max_frame_size
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(read_error)?;
    serde_json::from_slice(&buf).map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))
}

fn read_error(e: std::io::Error) -> anyhow::Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => anyhow::anyhow!("Connection closed by peer"),
        std::io::ErrorKind::ConnectionReset => anyhow::anyhow!("Connection reset by peer"),
        _ => anyhow::anyhow!("Read error: {}", e),
    }
}

fn write_error(e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe || e.kind() == std::io::ErrorKind::ConnectionReset {
        anyhow::anyhow!("Connection closed by peer")
    } else {
        anyhow::anyhow!("Write error: {}", e)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        let frame = encode_frame(&msg, self.max_frame_size)?;
        let send_op = async {
            self.stream.write_all(&frame).await.map_err(write_error)?;
            self.stream.flush().await.map_err(write_error)
        };
        timeout(self.timeout_duration, send_op)
            .await
            .map_err(|_| anyhow::anyhow!("Send timeout after {:?}", self.timeout_duration))?
    }

    async fn recv(&mut self) -> anyhow::Result<Message> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(msg);
            }
            let n = self.stream.read_buf(&mut self.buffer).await.map_err(read_error)?;
            if n == 0 {
                return Err(anyhow::anyhow!("Connection closed by peer"));
            }
        }
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}
