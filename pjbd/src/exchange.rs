//! One FastCGI request/response exchange over a pooled connection.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ConnectionError, ExchangeError};
use crate::fastcgi::{
    check_php_error, write_begin_request, write_params, write_record, EndRequest, FrameError,
    ResponseReader, FCGI_BUF_SIZE, FCGI_STDIN,
};
use crate::pool::{ConnectionPool, Lease};

const MAX_CGI_HEADER_BYTES: usize = 64 * 1024;
const MAX_CGI_HEADER_LINES: usize = 200;

/// What came back from the worker; the body went to the caller's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_len: u64,
    pub end: EndRequest,
    pub stderr: String,
}

impl ExchangeOutcome {
    /// PHP error reported on stderr, if any.
    pub fn php_error(&self) -> Option<&str> {
        check_php_error(&self.stderr)
    }

    pub fn check_error(&self) -> Result<(), ExchangeError> {
        match self.php_error() {
            Some(msg) => Err(ExchangeError::Php(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Runs one request: BEGIN_REQUEST, PARAMS, the body as STDIN, then reads
/// the response, parses the CGI header block and copies the rest to `sink`.
///
/// On any failure the connection is marked closed before it goes back to
/// the pool, so the worker never sees leftovers of an aborted request.
pub async fn run_exchange<I, K, V, B, S>(
    pool: &ConnectionPool,
    params: I,
    body: &mut B,
    sink: &mut S,
) -> Result<ExchangeOutcome, ExchangeError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
    B: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    let mut lease = pool.acquire().await?;
    match drive(&mut lease, params, body, sink).await {
        Ok(outcome) => {
            debug!(
                connection = lease.id(),
                status = outcome.status,
                body_len = outcome.body_len,
                app_status = outcome.end.app_status,
                "FastCGI exchange finished"
            );
            lease.release();
            Ok(outcome)
        }
        Err(e) => {
            debug!(connection = lease.id(), error = %e, "FastCGI exchange failed");
            lease.set_closed();
            lease.release();
            Err(e)
        }
    }
}

async fn drive<I, K, V, B, S>(
    lease: &mut Lease,
    params: I,
    body: &mut B,
    sink: &mut S,
) -> Result<ExchangeOutcome, ExchangeError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
    B: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    let id = lease.id();
    let conn_err = move |e: FrameError| ConnectionError::new(id, e);

    {
        let writer = lease.writer().map_err(|e| conn_err(e.into()))?;
        write_begin_request(writer).await.map_err(conn_err)?;
        write_params(writer, params).await.map_err(conn_err)?;
        let mut buf = vec![0u8; FCGI_BUF_SIZE];
        loop {
            let n = body.read(&mut buf).await.map_err(ExchangeError::Body)?;
            if n == 0 {
                break;
            }
            write_record(writer, FCGI_STDIN, &buf[..n])
                .await
                .map_err(conn_err)?;
        }
        write_record(writer, FCGI_STDIN, &[]).await.map_err(conn_err)?;
        writer.flush().await.map_err(|e| conn_err(e.into()))?;
    }
    lease.finish_output();

    let outcome = {
        let reader = lease.reader().map_err(|e| conn_err(e.into()))?;
        let mut response = ResponseReader::new(reader);

        let mut head = BytesMut::new();
        let mut body_len = 0u64;
        let (status, headers) = loop {
            match response.next_stdout().await.map_err(conn_err)? {
                Some(chunk) => {
                    head.extend_from_slice(&chunk);
                    if let Some((pos, sep_len)) = header_end(&head)? {
                        let parsed = parse_cgi_headers(&head[..pos])?;
                        let rest = &head[pos + sep_len..];
                        if !rest.is_empty() {
                            sink.write_all(rest).await.map_err(ExchangeError::Sink)?;
                            body_len += rest.len() as u64;
                        }
                        break parsed;
                    }
                }
                None if head.is_empty() => break (200, Vec::new()),
                None => return Err(ExchangeError::Header("missing CGI header boundary".into())),
            }
        };

        while let Some(chunk) = response.next_stdout().await.map_err(conn_err)? {
            sink.write_all(&chunk).await.map_err(ExchangeError::Sink)?;
            body_len += chunk.len() as u64;
        }
        let end = response.finish().await.map_err(conn_err)?;
        ExchangeOutcome {
            status,
            headers,
            body_len,
            end,
            stderr: String::from_utf8_lossy(response.stderr()).into_owned(),
        }
    };
    lease.finish_input();
    sink.flush().await.map_err(ExchangeError::Sink)?;
    Ok(outcome)
}

fn parse_cgi_headers(data: &[u8]) -> Result<(u16, Vec<(String, String)>), ExchangeError> {
    let header_str = std::str::from_utf8(data)
        .map_err(|_| ExchangeError::Header("CGI headers are not valid UTF-8".into()))?;
    let mut status = 200u16;
    let mut headers = Vec::new();
    let mut count = 0usize;

    for line in header_str.lines() {
        if count >= MAX_CGI_HEADER_LINES {
            return Err(ExchangeError::Header("too many CGI headers".into()));
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("Status") {
                if let Some(code) = value
                    .split_whitespace()
                    .next()
                    .and_then(|c| c.parse::<u16>().ok())
                    .filter(|c| (100..=999).contains(c))
                {
                    status = code;
                }
            } else if !key.is_empty() {
                headers.push((key.to_string(), value.to_string()));
            }
            count += 1;
        }
    }
    Ok((status, headers))
}

/// Locates the end of the CGI header block in what has arrived so far. The
/// size cap applies to the header block itself, not to body bytes that came
/// along in the same chunk.
fn header_end(head: &[u8]) -> Result<Option<(usize, usize)>, ExchangeError> {
    match find_header_boundary(head) {
        Some((pos, _)) if pos > MAX_CGI_HEADER_BYTES => {
            Err(ExchangeError::Header("CGI headers too large".into()))
        }
        Some(found) => Ok(Some(found)),
        // Leave room for a separator split across chunks.
        None if head.len() > MAX_CGI_HEADER_BYTES + 3 => {
            Err(ExchangeError::Header("CGI headers too large".into()))
        }
        None => Ok(None),
    }
}

fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}
