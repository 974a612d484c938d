//! One TCP session with the device.
//!
//! The device does not reliably terminate its responses, so a response ends
//! at the first newline, at a quiet gap once bytes have started to arrive,
//! at peer EOF, or after one raw read once the unterminated buffer outgrows
//! [`LINE_LIMIT`].

use crate::error::{AppError, Result};
use std::future::poll_fn;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Unterminated bytes tolerated before switching to a raw read.
pub const LINE_LIMIT: usize = 4096;
/// Upper bound of the fallback raw read.
pub const RAW_READ_LIMIT: usize = 4096;

const CHUNK: usize = 512;

/// One decoded response line. `terminated` is false when the line ended on
/// the settle gap, peer EOF or the raw-read fallback instead of a newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub text: String,
    pub terminated: bool,
}

pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

pub struct Session {
    stream: Option<Box<dyn DeviceStream>>,
    settle: Duration,
}

impl Session {
    pub fn new(settle: Duration) -> Self {
        Self {
            stream: None,
            settle,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self, host: &str, port: u16, limit: Duration) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let stream = match timeout(limit, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(AppError::ConnectFailed { addr, source }),
            Err(_) => {
                return Err(AppError::ConnectTimeout {
                    addr,
                    timeout: limit,
                })
            }
        };
        stream.set_nodelay(true)?;
        self.stream = Some(Box::new(stream));
        info!(addr = %addr, "connected to device");
        Ok(())
    }

    /// Use an already established stream instead of dialing.
    pub fn attach<S: DeviceStream + 'static>(&mut self, stream: S) {
        self.stream = Some(Box::new(stream));
    }

    /// Best effort: close errors are swallowed and the wait is bounded.
    pub async fn disconnect(&mut self, limit: Duration) {
        if let Some(mut stream) = self.stream.take() {
            match timeout(limit, stream.shutdown()).await {
                Ok(Ok(())) => debug!("session closed"),
                Ok(Err(e)) => debug!(error = %e, "error while closing session"),
                Err(_) => debug!("timed out closing session"),
            }
        }
    }

    pub async fn send_receive(&mut self, request: &str, limit: Duration) -> Result<Response> {
        let settle = self.settle;
        let stream = self.stream.as_mut().ok_or(AppError::NotConnected)?;

        let stale = discard_pending(stream).await?;
        if stale > 0 {
            debug!(discarded = stale, "dropped unsolicited bytes before request");
        }

        debug!(request = %request, "TX");
        // No terminator: the device neither needs nor expects one.
        match timeout(limit, async {
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AppError::Io(e)),
            Err(_) => return Err(AppError::ResponseTimeout(request.to_string())),
        }

        let response = read_response(stream, request, limit, settle).await?;
        debug!(response = %response.text, terminated = response.terminated, "RX");
        Ok(response)
    }
}

/// Drain whatever the device already sent, without waiting for more.
/// Returns the number of bytes thrown away.
pub async fn discard_pending<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut scratch = [0u8; CHUNK];
    let mut discarded = 0;
    loop {
        let mut buf = ReadBuf::new(&mut scratch);
        let ready = poll_fn(|cx| match Pin::new(&mut *reader).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Ready(None),
            Poll::Ready(r) => Poll::Ready(Some(r)),
        })
        .await;
        match ready {
            None => return Ok(discarded),
            Some(Err(e)) => return Err(AppError::Io(e)),
            Some(Ok(())) if buf.filled().is_empty() => {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by device",
                )))
            }
            Some(Ok(())) => discarded += buf.filled().len(),
        }
    }
}

pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    request: &str,
    limit: Duration,
    settle: Duration,
) -> Result<Response> {
    let deadline = Instant::now() + limit;
    let mut terminated = false;
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK);
    let mut chunk = [0u8; CHUNK];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = if buf.is_empty() {
            remaining
        } else {
            settle.min(remaining)
        };

        let n = match timeout(wait, reader.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(AppError::Io(e)),
            Err(_) if buf.is_empty() => break,
            Err(_) => {
                debug!(len = buf.len(), "response settled without terminator");
                break;
            }
        };

        if n == 0 {
            if buf.is_empty() {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by device",
                )));
            }
            break;
        }

        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos + 1 < buf.len() {
                debug!(discarded = buf.len() - pos - 1, "dropping bytes after terminator");
            }
            buf.truncate(pos);
            terminated = true;
            break;
        }

        if buf.len() > LINE_LIMIT {
            debug!(len = buf.len(), "no terminator within line limit, falling back to raw read");
            let mut raw = vec![0u8; RAW_READ_LIMIT];
            let wait = settle.min(deadline.saturating_duration_since(Instant::now()));
            if let Ok(Ok(n)) = timeout(wait, reader.read(&mut raw)).await {
                buf.extend_from_slice(&raw[..n]);
            }
            break;
        }
    }

    if buf.is_empty() {
        return Err(AppError::ResponseTimeout(request.to_string()));
    }

    let text = String::from_utf8_lossy(&buf).trim().to_string();
    if text.is_empty() {
        return Err(AppError::EmptyResponse(request.to_string()));
    }
    Ok(Response { text, terminated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    const LIMIT: Duration = Duration::from_secs(5);
    const SETTLE: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn test_newline_terminated_response() {
        let mock = tokio_test::io::Builder::new()
            .write(b"VSt07_544b")
            .read(b"VSt07_1_2_3\n")
            .build();
        let mut session = Session::new(SETTLE);
        session.attach(mock);

        let resp = session.send_receive("VSt07_544b", LIMIT).await.unwrap();
        assert_eq!(resp.text, "VSt07_1_2_3");
        assert!(resp.terminated);
    }

    #[tokio::test]
    async fn test_crlf_is_trimmed() {
        let mock = tokio_test::io::Builder::new()
            .write(b"VWPwr_544b_1")
            .read(b"OK\r\n")
            .build();
        let mut session = Session::new(SETTLE);
        session.attach(mock);

        assert_eq!(session.send_receive("VWPwr_544b_1", LIMIT).await.unwrap().text, "OK");
    }

    #[tokio::test]
    async fn test_response_split_across_reads() {
        let (client, mut device) = duplex(1024);
        let mut session = Session::new(SETTLE);
        session.attach(client);

        let writer = tokio::spawn(async move {
            let mut req = [0u8; 10];
            device.read_exact(&mut req).await.unwrap();
            device.write_all(b"VSt07_").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            device.write_all(b"1_2\nVSt07_junk").await.unwrap();
            device
        });

        let resp = session.send_receive("VSt07_544b", LIMIT).await.unwrap();
        assert_eq!(resp.text, "VSt07_1_2");
        drop(writer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unterminated_response_completes_after_settle() {
        let (mut reader, mut device) = duplex(1024);
        device.write_all(b"VSens_fb07_e1").await.unwrap();

        let started = Instant::now();
        let resp = read_response(&mut reader, "VSens_544b", LIMIT, SETTLE)
            .await
            .unwrap();

        assert_eq!(resp.text, "VSens_fb07_e1");
        assert!(!resp.terminated);
        assert!(started.elapsed() < LIMIT);
        drop(device);
    }

    #[tokio::test]
    async fn test_oversized_unterminated_response_uses_raw_read() {
        let (mut reader, mut device) = duplex(16 * 1024);
        let mut payload = vec![b'a'; LINE_LIMIT + 904];
        payload.extend_from_slice(b"_tail");
        device.write_all(&payload).await.unwrap();

        let resp = read_response(&mut reader, "VSt07_544b", LIMIT, SETTLE)
            .await
            .unwrap();

        assert_eq!(resp.text.len(), payload.len());
        assert!(resp.text.ends_with("_tail"));
        assert!(!resp.terminated);
        drop(device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_a_timeout() {
        let (mut reader, _device) = duplex(1024);
        let err = read_response(&mut reader, "VSt07_544b", LIMIT, SETTLE)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ResponseTimeout(ref r) if r == "VSt07_544b"));
    }

    #[tokio::test]
    async fn test_whitespace_only_is_empty_response() {
        let (mut reader, mut device) = duplex(1024);
        device.write_all(b"  \r\n").await.unwrap();
        let err = read_response(&mut reader, "VSt07_544b", LIMIT, SETTLE)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmptyResponse(_)));
    }

    #[tokio::test]
    async fn test_peer_close_without_data() {
        let (mut reader, device) = duplex(1024);
        drop(device);
        let err = read_response(&mut reader, "VSt07_544b", LIMIT, SETTLE)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_stale_bytes_dropped_before_request() {
        let mock = tokio_test::io::Builder::new()
            .read(b"_1615_2d_3c43_c80_0_0_0\n")
            .write(b"VSens_544b")
            .read(b"VSens_c3\n")
            .build();
        let mut session = Session::new(SETTLE);
        session.attach(mock);

        let resp = session.send_receive("VSens_544b", LIMIT).await.unwrap();
        assert_eq!(resp.text, "VSens_c3");
    }

    #[tokio::test]
    async fn test_discard_pending_returns_without_waiting() {
        let (mut reader, mut device) = duplex(1024);
        assert_eq!(discard_pending(&mut reader).await.unwrap(), 0);

        device.write_all(b"VSt07_leftover\n").await.unwrap();
        assert_eq!(discard_pending(&mut reader).await.unwrap(), 15);
        assert_eq!(discard_pending(&mut reader).await.unwrap(), 0);

        drop(device);
        assert!(discard_pending(&mut reader).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let mut session = Session::new(SETTLE);
        let err = session.send_receive("VSt07_544b", LIMIT).await.unwrap_err();
        assert!(matches!(err, AppError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = Session::new(SETTLE);
        let err = session.connect("127.0.0.1", port, LIMIT).await.unwrap_err();
        assert!(matches!(err, AppError::ConnectFailed { .. }));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (client, _device) = duplex(64);
        let mut session = Session::new(SETTLE);
        session.attach(client);
        assert!(session.is_connected());

        session.disconnect(LIMIT).await;
        session.disconnect(LIMIT).await;
        assert!(!session.is_connected());
    }
}
