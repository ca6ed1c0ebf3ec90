use std::{io, time::Duration};

use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    client::conn::http1::{self, SendRequest},
    header::HOST,
    Method, Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpStream, task::JoinHandle};
use tracing::debug;

use crate::automaton::{ACCEPT, REJECT};
use crate::command::{self, Command};
use crate::error::{Error, Result};
use crate::http::Instance;

/// An open connection to the device.
///
/// The connection lives exactly as long as the value: dropping it, on whatever path, closes it.
pub struct Device {
    host: String,
    sender: SendRequest<Full<Bytes>>,
    conn: JoinHandle<()>,
    // (max_write, max_read) as advertised by the device, fetched on first need.
    limits: Option<(usize, usize)>,
}

impl Drop for Device {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

impl Device {
    /// Transfers up to this size go out as one request without asking the device for its
    /// limits first.
    pub const CHUNK: usize = 8 << 20;

    pub async fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io).await?;
        let conn = tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                debug!("device connection failed: {:?}", err);
            }
        });
        Ok(Device { host: addr.to_string(), sender, conn, limits: None })
    }

    pub fn close(self) {}

    async fn request(&mut self, method: Method, uri: &str, body: Bytes) -> Result<Bytes> {
        let sent = body.len();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, &self.host)
            .body(Full::new(body))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        self.sender.ready().await?;
        let res = self.sender.send_request(req).await?;
        let status = res.status();
        let body = res.into_body().collect().await?.to_bytes();
        if status.is_success() {
            return Ok(body);
        }

        let message = String::from_utf8_lossy(&body).into_owned();
        Err(match status {
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
                Error::OutOfRange(message.trim().parse().unwrap_or(sent as i64))
            }
            StatusCode::NOT_IMPLEMENTED => Error::NotSupported(message),
            StatusCode::BAD_REQUEST => Error::Io(io::Error::new(io::ErrorKind::InvalidInput, message)),
            _ => Error::Rejected { status: status.as_u16(), message },
        })
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.request(Method::GET, "/ping", Bytes::new()).await.map(|_| ())
    }

    pub async fn instance(&mut self) -> Result<Instance> {
        let body = self.request(Method::GET, "/instance", Bytes::new()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Apply commands in order, as one atomic batch.
    pub async fn control(&mut self, commands: &[Command]) -> Result<()> {
        let body = serde_json::to_vec(commands)?;
        self.request(Method::POST, "/control", body.into()).await.map(|_| ())
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.control(&[Command::Reset]).await
    }

    pub async fn add(&mut self, p: i64, a: i64, q: i64) -> Result<()> {
        self.control(&[Command::AddTransition { p, a, q }]).await
    }

    pub async fn accept(&mut self, p: i64) -> Result<()> {
        self.control(&[Command::Accept { p }]).await
    }

    pub async fn reject(&mut self, p: i64) -> Result<()> {
        self.control(&[Command::Reject { p }]).await
    }

    /// Point every transition at state 0 and reject every state, leaving the run where it is.
    pub async fn reset_device(&mut self) -> Result<()> {
        self.control(&command::reset_device()).await
    }

    /// Raw ioctl, numbered as on the character device.
    pub async fn ioctl(&mut self, request: u32, arg: &[u8]) -> Result<()> {
        let uri = format!("/ioctl?request={request:#010x}");
        self.request(Method::POST, &uri, Bytes::copy_from_slice(arg)).await.map(|_| ())
    }

    async fn limits(&mut self) -> Result<(usize, usize)> {
        if let Some(limits) = self.limits {
            return Ok(limits);
        }
        let instance = self.instance().await?;
        let limits = (instance.max_write.max(1), instance.max_read.max(1));
        self.limits = Some(limits);
        Ok(limits)
    }

    // Bytes per request for a transfer of `len`: all of them unless the device serves less.
    async fn span(&mut self, len: usize, write: bool) -> Result<usize> {
        if len <= Self::CHUNK {
            return Ok(len.max(1));
        }
        let (max_write, max_read) = self.limits().await?;
        Ok(len.min(if write { max_write } else { max_read }))
    }

    /// Feed `data` through the automaton.
    ///
    /// Whatever the device accepts in one request is applied in one piece, so no other client's
    /// write lands in the middle. Only data beyond the device's write limit is split.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let span = self.span(data.len(), true).await?;
        let mut written = 0;
        for chunk in data.chunks(span) {
            let body = self.request(Method::POST, "/data", Bytes::copy_from_slice(chunk)).await?;
            let count: usize = String::from_utf8_lossy(&body).trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "write count is not a number")
            })?;
            if count != chunk.len() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("device consumed {count} of {} bytes", chunk.len()),
                )));
            }
            written += count;
        }
        Ok(written)
    }

    /// Exactly `n` status bytes, each checked to be `Y` or `N`.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let span = self.span(n, false).await?;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let want = (n - out.len()).min(span);
            let body = self.request(Method::GET, &format!("/data?n={want}"), Bytes::new()).await?;
            if body.len() != want {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("device returned {} of {want} bytes", body.len()),
                )));
            }
            if let Some(&bad) = body.iter().find(|&&b| b != ACCEPT && b != REJECT) {
                return Err(Error::MalformedStatusByte(bad));
            }
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    /// Whether the run so far is accepted.
    pub async fn fin(&mut self) -> Result<bool> {
        let status = self.read(1).await?;
        Ok(status[0] == ACCEPT)
    }

    /// Ask the engine to hand its store over to a new instance.
    pub async fn update(&mut self) -> Result<()> {
        self.request(Method::POST, "/update", Bytes::new()).await.map(|_| ())
    }
}

/// Trigger a live upgrade and wait until a newer instance answers on `addr`.
pub async fn update(addr: &str, timeout: Duration) -> Result<Instance> {
    let old = {
        let mut dev = Device::open(addr).await?;
        let old = dev.instance().await?;
        dev.update().await?;
        old
    };

    let poll = async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let Ok(mut dev) = Device::open(addr).await else { continue };
            match dev.instance().await {
                Ok(instance) if instance.generation > old.generation => return instance,
                _ => continue,
            }
        }
    };
    tokio::time::timeout(timeout, poll).await.map_err(|_| {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut, "no new instance came up"))
    })
}
