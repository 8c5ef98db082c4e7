//! Device transport: how sessions obtain a byte stream, and how whole frames
//! are cut out of it.

use crate::error::{FrameError, Result, TuyaError};
use crate::protocol::{PREFIX_55AA, PREFIX_6699, header_len_for, parse_header};
use log::debug;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

/// Bytes of garbage tolerated before a frame prefix is found.
const MAX_PREFIX_SCAN: usize = 1024;

/// Opens byte streams to devices.
///
/// Sessions are generic over the connector so tests can hand out in-memory
/// pipes instead of TCP sockets.
pub trait Connector: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        address: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP connector with kernel keepalive enabled.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keepalive: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(stream)
    }
}

/// Reads one complete raw frame from `reader`.
///
/// Waiting for the first byte is unbounded so an idle connection can sit in
/// here; once a frame has started, every further read must finish within
/// `read_timeout`.
pub async fn read_frame<R>(reader: &mut R, read_timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await.map_err(closed_or_io)?;

    macro_rules! bounded {
        ($fut:expr) => {
            timeout(read_timeout, $fut)
                .await
                .map_err(|_| TuyaError::Timeout)?
                .map_err(closed_or_io)?
        };
    }

    let mut window = [first, 0, 0, 0];
    for b in &mut window[1..] {
        *b = bounded!(reader.read_u8());
    }

    let mut skipped = 0usize;
    loop {
        let prefix = u32::from_be_bytes(window);
        if prefix == PREFIX_55AA || prefix == PREFIX_6699 {
            break;
        }
        skipped += 1;
        if skipped > MAX_PREFIX_SCAN {
            return Err(FrameError::MalformedHeader("no frame prefix in stream").into());
        }
        window.rotate_left(1);
        window[3] = bounded!(reader.read_u8());
    }
    if skipped > 0 {
        debug!("Skipped {} bytes before frame prefix", skipped);
    }

    let prefix = u32::from_be_bytes(window);
    let header_len = header_len_for(prefix);
    let mut frame = vec![0u8; header_len];
    frame[..4].copy_from_slice(&window);
    bounded!(reader.read_exact(&mut frame[4..]));

    let header = parse_header(&frame)?;
    frame.resize(header.total_len, 0);
    bounded!(reader.read_exact(&mut frame[header_len..]));
    Ok(frame)
}

fn closed_or_io(err: io::Error) -> TuyaError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TuyaError::Io("connection closed by device".to_string())
    } else {
        TuyaError::from(err)
    }
}
