//! Minimal HTTP/1.1 over an already opened tunnel.
//!
//! Requests are always `GET` with `Connection: close`, so each connection
//! carries exactly one exchange.

use crate::errors::BenchError;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING,
};
use http::StatusCode;
use log::debug;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};
use tokio::time::Instant;
use url::Url;

/// Upper bound on status line plus headers, and on chunked trailers.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a chunk-size line.
const MAX_CHUNK_LINE_BYTES: usize = 1024;

/// Build the request header block for a `GET` of `url`.
pub(crate) fn build_request(url: &Url, user_agent: &str) -> String {
    let host = url.host_str().unwrap_or_default();
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    format!(
        "GET {} HTTP/1.1\r\n\
        Host: {}\r\n\
        User-Agent: {}\r\n\
        Accept: */*\r\n\
        Cache-Control: no-cache\r\n\
        Connection: close\r\n\
        \r\n",
        target, host, user_agent
    )
}

pub(crate) async fn send_request<W: AsyncWrite + Unpin>(
    stream: &mut W,
    url: &Url,
    user_agent: &str,
) -> io::Result<()> {
    let request = build_request(url, user_agent);
    debug!("\r\n{}", request);

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await
}

/// Status line and headers of a response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Time from `started` until the first response byte arrived.
    pub ttfb: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    /// Bytes left in the current chunk.
    Chunked(u64),
    Close,
    Done,
}

impl Framing {
    fn from_head(head: &ResponseHead) -> Result<Self, BenchError> {
        if head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Ok(Framing::Done);
        }

        let chunked = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.to_ascii_lowercase().contains("chunked"));

        if chunked {
            return Ok(Framing::Chunked(0));
        }

        match head.headers.get(CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Framing::Length)
                .ok_or_else(|| {
                    BenchError::protocol("invalid content-length header")
                }),
            None => Ok(Framing::Close),
        }
    }
}

/// A response whose head has been read and whose body is still on the wire.
pub(crate) struct Response<R> {
    pub head: ResponseHead,
    reader: BufReader<R>,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> Response<R> {
    /// Read the response head from `stream`.
    ///
    /// TTFB is measured from `started` to the moment the first byte of the
    /// response is buffered.
    pub(crate) async fn read(
        stream: R,
        started: Instant,
    ) -> Result<Self, BenchError> {
        let mut reader = BufReader::new(stream);

        loop {
            if reader.fill_buf().await?.is_empty() {
                return Err(BenchError::protocol(
                    "connection closed before response",
                ));
            }
            let ttfb = started.elapsed();

            let head = read_head(&mut reader, ttfb).await?;
            if head.status.is_informational() {
                continue;
            }

            let framing = Framing::from_head(&head)?;
            return Ok(Self { head, reader, framing });
        }
    }

    /// Read the next piece of the decoded body. Returns 0 at the end.
    pub(crate) async fn read_body(
        &mut self,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        match self.framing {
            Framing::Done => Ok(0),
            Framing::Close => self.reader.read(buf).await,
            Framing::Length(0) => {
                self.framing = Framing::Done;
                Ok(0)
            }
            Framing::Length(remaining) => {
                let n = self.read_bounded(buf, remaining).await?;
                self.framing = Framing::Length(remaining - n as u64);
                Ok(n)
            }
            Framing::Chunked(remaining) => {
                let remaining = if remaining == 0 {
                    let size = read_chunk_size(&mut self.reader).await?;
                    if size == 0 {
                        skip_trailers(&mut self.reader).await?;
                        self.framing = Framing::Done;
                        return Ok(0);
                    }
                    size
                } else {
                    remaining
                };

                let n = self.read_bounded(buf, remaining).await?;
                let remaining = remaining - n as u64;
                if remaining == 0 {
                    expect_line_end(&mut self.reader).await?;
                }
                self.framing = Framing::Chunked(remaining);
                Ok(n)
            }
        }
    }

    /// Read the whole body, failing once it grows past `limit` bytes.
    pub(crate) async fn read_to_end(
        &mut self,
        limit: usize,
    ) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut buf = [0u8; 8 * 1024];

        loop {
            let n = self.read_body(&mut buf).await?;
            if n == 0 {
                return Ok(body);
            }
            if body.len() + n > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response body exceeds {} bytes", limit),
                ));
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    async fn read_bounded(
        &mut self,
        buf: &mut [u8],
        remaining: u64,
    ) -> io::Result<usize> {
        let max = remaining.min(buf.len() as u64) as usize;
        let n = self.reader.read(&mut buf[..max]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        Ok(n)
    }
}

/// Read through the next `\n`, failing with `InvalidData` once `limit`
/// bytes have been read without one. An empty line means end of stream.
async fn read_limited_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limit: usize,
) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.len() == limit && !line.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", limit),
        ));
    }

    Ok(line)
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    budget: &mut usize,
) -> Result<String, BenchError> {
    let line = read_limited_line(reader, *budget).await.map_err(|e| {
        if e.kind() == io::ErrorKind::InvalidData {
            BenchError::protocol(format!(
                "response head exceeds {} bytes",
                MAX_HEAD_BYTES
            ))
        } else {
            e.into()
        }
    })?;
    if line.is_empty() {
        return Err(BenchError::protocol("connection closed inside headers"));
    }

    *budget -= line.len();

    let line = String::from_utf8_lossy(&line);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    ttfb: Duration,
) -> Result<ResponseHead, BenchError> {
    let mut budget = MAX_HEAD_BYTES;

    let status_line = read_line(reader, &mut budget).await?;
    let status = parse_status_line(&status_line)?;

    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };

        headers.append(name, value);
    }

    Ok(ResponseHead { status, headers, ttfb })
}

pub(crate) fn parse_status_line(line: &str) -> Result<StatusCode, BenchError> {
    let mut parts = line.split_whitespace();

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(BenchError::protocol(format!(
            "malformed status line: {:?}",
            line
        )));
    }

    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            BenchError::protocol(format!("malformed status line: {:?}", line))
        })
}

async fn read_chunk_size<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> io::Result<u64> {
    let line = read_limited_line(reader, MAX_CHUNK_LINE_BYTES).await?;
    if line.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before chunk size",
        ));
    }

    let line = String::from_utf8_lossy(&line);
    // chunk extensions follow a ';'
    let size = line.trim().split(';').next().unwrap_or_default();

    u64::from_str_radix(size.trim(), 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size: {:?}", line.trim()),
        )
    })
}

async fn expect_line_end<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> io::Result<()> {
    let line = read_limited_line(reader, 2).await?;

    if line.trim_ascii().is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing CRLF after chunk data",
        ))
    }
}

async fn skip_trailers<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> io::Result<()> {
    let mut budget = MAX_HEAD_BYTES;

    loop {
        let line = read_limited_line(reader, budget).await?;
        if line.is_empty() || line.trim_ascii().is_empty() {
            return Ok(());
        }
        budget -= line.len();
    }
}
