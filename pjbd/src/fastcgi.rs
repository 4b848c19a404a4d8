//! FastCGI record framing for the responder role, client side.
//!
//! Every exchange uses request id 1: a physical connection carries one
//! logical request at a time and is never multiplexed.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

// FastCGI record types.
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;

// FastCGI roles and flags.
pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_KEEP_CONN: u8 = 1;

// Protocol status codes.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;

pub const FCGI_VERSION_1: u8 = 1;
pub const FCGI_REQUEST_ID: u16 = 1;
/// Largest content length a single record can carry.
pub const FCGI_BUF_SIZE: usize = 65535;

const MAX_STDERR_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("record content of {0} bytes exceeds the 65535 byte limit")]
    Oversized(usize),
    #[error("{0}")]
    Protocol(String),
}

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    pub fn decode(buf: &[u8; 8]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// A complete FastCGI record (header + content, padding stripped).
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

impl Record {
    pub fn record_type(&self) -> u8 {
        self.header.record_type
    }

    /// Empty stream records terminate their stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self.header.record_type,
            FCGI_PARAMS | FCGI_STDIN | FCGI_STDOUT | FCGI_STDERR
        ) && self.content.is_empty()
    }
}

fn padding_for(len: usize) -> usize {
    (8 - (len % 8)) % 8
}

fn record_header(record_type: u8, content_len: usize) -> RecordHeader {
    RecordHeader {
        version: FCGI_VERSION_1,
        record_type,
        request_id: FCGI_REQUEST_ID,
        content_length: content_len as u16,
        padding_length: padding_for(content_len) as u8,
    }
}

fn put_record(buf: &mut BytesMut, record_type: u8, content: &[u8]) {
    let header = record_header(record_type, content.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
}

/// Frames `content` as a single record.
pub fn encode_record(record_type: u8, content: &[u8]) -> Result<Bytes, FrameError> {
    if content.len() > FCGI_BUF_SIZE {
        return Err(FrameError::Oversized(content.len()));
    }
    let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + content.len() + 7);
    put_record(&mut buf, record_type, content);
    Ok(buf.freeze())
}

/// Frames `payload` as a stream: as many full records as needed, the
/// remainder, then the empty terminator record.
pub fn encode_stream(record_type: u8, payload: &[u8]) -> Bytes {
    let records = payload.len() / FCGI_BUF_SIZE + 2;
    let mut buf = BytesMut::with_capacity(payload.len() + records * (RecordHeader::SIZE + 7));
    for chunk in payload.chunks(FCGI_BUF_SIZE) {
        put_record(&mut buf, record_type, chunk);
    }
    put_record(&mut buf, record_type, &[]);
    buf.freeze()
}

/// Encode a FastCGI name-value pair into the buffer.
pub fn encode_name_value(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    fn write_len(buf: &mut BytesMut, len: usize) {
        if len < 128 {
            buf.put_u8(len as u8);
        } else {
            buf.put_u32((len as u32) | 0x8000_0000);
        }
    }
    write_len(buf, name.len());
    write_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

/// Encodes the PARAMS stream. Pairs with an empty name or value are left out.
pub fn encode_params<I, K, V>(params: I) -> Bytes
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut body = BytesMut::new();
    for (name, value) in params {
        let (name, value) = (name.as_ref(), value.as_ref());
        if name.is_empty() || value.is_empty() {
            continue;
        }
        encode_name_value(&mut body, name, value);
    }
    encode_stream(FCGI_PARAMS, &body)
}

/// BEGIN_REQUEST body: RESPONDER role, keep the connection open afterwards.
pub fn encode_begin_request() -> Bytes {
    let mut body = [0u8; 8];
    body[0..2].copy_from_slice(&FCGI_RESPONDER.to_be_bytes());
    body[2] = FCGI_KEEP_CONN;
    let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
    put_record(&mut buf, FCGI_BEGIN_REQUEST, &body);
    buf.freeze()
}

/// Decode all name-value pairs from a FastCGI PARAMS content buffer.
pub fn decode_name_values(mut data: &[u8]) -> Result<HashMap<String, String>, FrameError> {
    let mut map = HashMap::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data)?;
        let value_len = read_nv_len(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(FrameError::Protocol("truncated name-value pair".into()));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[name_len..name_len + value_len]).into_owned();
        data = &data[name_len + value_len..];
        map.insert(name, value);
    }
    Ok(map)
}

fn read_nv_len(data: &mut &[u8]) -> Result<usize, FrameError> {
    let Some(&first) = data.first() else {
        return Err(FrameError::Protocol(
            "unexpected end of name-value data".into(),
        ));
    };
    if first < 128 {
        *data = &data[1..];
        Ok(first as usize)
    } else {
        if data.len() < 4 {
            return Err(FrameError::Protocol(
                "truncated 4-byte name-value length".into(),
            ));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        Ok(len as usize)
    }
}

/// Reads one record. `Ok(None)` means the peer closed the stream cleanly
/// on a record boundary; EOF anywhere inside a record is an error.
pub async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Record>, FrameError> {
    let mut hdr_buf = [0u8; RecordHeader::SIZE];
    let mut filled = 0;
    while filled < hdr_buf.len() {
        let n = reader.read(&mut hdr_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::UnexpectedEof("record header"));
        }
        filled += n;
    }
    let header = RecordHeader::decode(&hdr_buf);
    if header.version != FCGI_VERSION_1 {
        return Err(FrameError::Protocol(format!(
            "unsupported FastCGI version: {} (expected {})",
            header.version, FCGI_VERSION_1
        )));
    }

    let content_len = header.content_length as usize;
    let total = content_len + header.padding_length as usize;
    let mut buf = BytesMut::zeroed(total);
    if total > 0 {
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::UnexpectedEof("record content")
            } else {
                FrameError::Io(e)
            }
        })?;
    }
    buf.truncate(content_len);
    Ok(Some(Record {
        header,
        content: buf.freeze(),
    }))
}

/// Reassembles one stream of `record_type` up to its empty terminator.
pub async fn decode_stream<R: AsyncRead + Unpin>(
    reader: &mut R,
    record_type: u8,
) -> Result<Bytes, FrameError> {
    let mut out = BytesMut::new();
    loop {
        let Some(rec) = read_record(reader).await? else {
            return Err(FrameError::UnexpectedEof("stream"));
        };
        if rec.record_type() != record_type {
            return Err(FrameError::Protocol(format!(
                "expected record type {}, got {}",
                record_type,
                rec.record_type()
            )));
        }
        if rec.content.is_empty() {
            return Ok(out.freeze());
        }
        out.extend_from_slice(&rec.content);
    }
}

/// Write one FastCGI record to an async writer.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: u8,
    content: &[u8],
) -> Result<(), FrameError> {
    if content.len() > FCGI_BUF_SIZE {
        return Err(FrameError::Oversized(content.len()));
    }
    let header = record_header(record_type, content.len());
    writer.write_all(&header.encode()).await?;
    if !content.is_empty() {
        writer.write_all(content).await?;
    }
    let padding = header.padding_length as usize;
    if padding > 0 {
        writer.write_all(&[0u8; 8][..padding]).await?;
    }
    Ok(())
}

/// Write `payload` in chunks of at most 65535 bytes, then an empty record.
pub async fn write_stream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: u8,
    payload: &[u8],
) -> Result<(), FrameError> {
    for chunk in payload.chunks(FCGI_BUF_SIZE) {
        write_record(writer, record_type, chunk).await?;
    }
    write_record(writer, record_type, &[]).await
}

pub async fn write_begin_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    writer.write_all(&encode_begin_request()).await?;
    Ok(())
}

pub async fn write_params<W, I, K, V>(writer: &mut W, params: I) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    writer.write_all(&encode_params(params)).await?;
    Ok(())
}

/// Body of the END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequest {
    pub fn decode(content: &[u8]) -> Result<Self, FrameError> {
        if content.len() < 5 {
            return Err(FrameError::Protocol(format!(
                "END_REQUEST body too short ({} bytes)",
                content.len()
            )));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        body[4] = self.protocol_status;
        body
    }
}

/// Demultiplexes a responder's reply: STDOUT is handed to the caller, STDERR
/// is mirrored to the log and collected, END_REQUEST ends the response.
pub struct ResponseReader<'a, R> {
    reader: &'a mut R,
    stderr: BytesMut,
    stderr_truncated: bool,
    end: Option<EndRequest>,
}

impl<'a, R: AsyncRead + Unpin> ResponseReader<'a, R> {
    pub fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            stderr: BytesMut::new(),
            stderr_truncated: false,
            end: None,
        }
    }

    /// Next non-empty STDOUT chunk, or `None` once END_REQUEST was drained.
    pub async fn next_stdout(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.end.is_some() {
            return Ok(None);
        }
        loop {
            let Some(rec) = read_record(self.reader).await? else {
                return Err(FrameError::UnexpectedEof("response"));
            };
            if rec.header.request_id != FCGI_REQUEST_ID {
                return Err(FrameError::Protocol(format!(
                    "response for request id {} on a non-multiplexed connection",
                    rec.header.request_id
                )));
            }
            match rec.record_type() {
                FCGI_STDOUT => {
                    if !rec.content.is_empty() {
                        return Ok(Some(rec.content));
                    }
                }
                FCGI_STDERR => self.push_stderr(&rec.content),
                FCGI_END_REQUEST => {
                    self.end = Some(EndRequest::decode(&rec.content)?);
                    return Ok(None);
                }
                other => {
                    return Err(FrameError::Protocol(format!(
                        "unexpected record type {other} in response"
                    )))
                }
            }
        }
    }

    /// Skips any remaining STDOUT and returns the END_REQUEST body.
    pub async fn finish(&mut self) -> Result<EndRequest, FrameError> {
        while self.next_stdout().await?.is_some() {}
        self.end
            .ok_or(FrameError::UnexpectedEof("END_REQUEST"))
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn into_stderr(self) -> Bytes {
        self.stderr.freeze()
    }

    fn push_stderr(&mut self, content: &[u8]) {
        if content.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(content);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            warn!(target: "fastcgi_stderr", "{}", line);
        }
        let room = MAX_STDERR_BYTES.saturating_sub(self.stderr.len());
        if room < content.len() && !self.stderr_truncated {
            self.stderr_truncated = true;
            warn!(
                limit = MAX_STDERR_BYTES,
                "FastCGI stderr exceeds buffer limit, truncating"
            );
        }
        self.stderr
            .extend_from_slice(&content[..room.min(content.len())]);
    }
}

/// Returns the first stderr line that reports a PHP error.
pub fn check_php_error(stderr: &str) -> Option<&str> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("PHP") && line.contains("error:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let wire = encode_stream(FCGI_STDOUT, &payload);
        let mut reader = &wire[..];
        let decoded = decode_stream(&mut reader, FCGI_STDOUT).await.unwrap();
        assert_eq!(&decoded[..], &payload[..]);
        assert!(reader.is_empty(), "trailing bytes after terminator");
    }

    #[tokio::test]
    async fn stream_round_trip_across_split_boundary() {
        round_trip(0).await;
        round_trip(1).await;
        round_trip(FCGI_BUF_SIZE).await;
        round_trip(FCGI_BUF_SIZE + 1).await;
    }

    #[test]
    fn stream_splits_at_capacity() {
        let payload = vec![7u8; FCGI_BUF_SIZE + 1];
        let wire = encode_stream(FCGI_STDIN, &payload);

        let first = RecordHeader::decode(wire[..8].try_into().unwrap());
        assert_eq!(first.record_type, FCGI_STDIN);
        assert_eq!(first.content_length as usize, FCGI_BUF_SIZE);
        assert_eq!(first.padding_length, 1);

        let off = 8 + FCGI_BUF_SIZE + 1;
        let second = RecordHeader::decode(wire[off..off + 8].try_into().unwrap());
        assert_eq!(second.content_length, 1);
        assert_eq!(second.padding_length, 7);

        let off = off + 16;
        let last = RecordHeader::decode(wire[off..off + 8].try_into().unwrap());
        assert_eq!(last.content_length, 0);
        assert_eq!(wire.len(), off + 8);
    }

    #[test]
    fn empty_stream_is_only_terminator() {
        let wire = encode_stream(FCGI_STDIN, &[]);
        assert_eq!(&wire[..], &[1, FCGI_STDIN, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn encode_record_rejects_oversized_content() {
        let err = encode_record(FCGI_STDOUT, &vec![0u8; FCGI_BUF_SIZE + 1]).unwrap_err();
        assert!(matches!(err, FrameError::Oversized(n) if n == FCGI_BUF_SIZE + 1));
    }

    #[test]
    fn params_skip_empty_names_and_values() {
        let wire = encode_params([("SCRIPT_FILENAME", "/srv/a.php"), ("", "x"), ("EMPTY", "")]);
        let header = RecordHeader::decode(wire[..8].try_into().unwrap());
        assert_eq!(header.record_type, FCGI_PARAMS);
        let len = header.content_length as usize;
        let params = decode_name_values(&wire[8..8 + len]).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["SCRIPT_FILENAME"], "/srv/a.php");

        let expected = encode_params([("SCRIPT_FILENAME", "/srv/a.php")]);
        assert_eq!(wire, expected);
    }

    #[test]
    fn empty_params_map_is_only_terminator() {
        let wire = encode_params(HashMap::<String, String>::new());
        assert_eq!(wire, encode_record(FCGI_PARAMS, &[]).unwrap());
    }

    #[test]
    fn long_param_lengths_use_four_bytes() {
        let value = "v".repeat(200);
        let mut buf = BytesMut::new();
        encode_name_value(&mut buf, b"K", value.as_bytes());
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..5], &(200u32 | 0x8000_0000).to_be_bytes());
        let decoded = decode_name_values(&buf).unwrap();
        assert_eq!(decoded["K"], value);
    }

    #[test]
    fn begin_request_is_responder_with_keep_conn() {
        let wire = encode_begin_request();
        assert_eq!(
            &wire[..],
            &[1, FCGI_BEGIN_REQUEST, 0, 1, 0, 8, 0, 0, 0, 1, FCGI_KEEP_CONN, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn read_record_retries_partial_header_reads() {
        let wire = encode_record(FCGI_STDOUT, b"hello").unwrap();
        let (head, tail) = wire.split_at(3);
        let mut reader = head.chain(tail);
        let rec = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(rec.record_type(), FCGI_STDOUT);
        assert_eq!(&rec.content[..], b"hello");
    }

    #[tokio::test]
    async fn read_record_distinguishes_clean_eof_from_truncation() {
        let mut empty: &[u8] = &[];
        assert!(read_record(&mut empty).await.unwrap().is_none());

        let wire = encode_record(FCGI_STDOUT, b"hello").unwrap();
        let mut short = &wire[..5];
        let err = read_record(&mut short).await.unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEof("record header")));

        let mut short = &wire[..10];
        let err = read_record(&mut short).await.unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEof("record content")));
    }

    #[tokio::test]
    async fn read_record_drains_padding() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_record(FCGI_STDOUT, b"abc").unwrap());
        wire.extend_from_slice(&encode_record(FCGI_STDERR, b"de").unwrap());
        let mut reader = &wire[..];
        let a = read_record(&mut reader).await.unwrap().unwrap();
        let b = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(&a.content[..], b"abc");
        assert_eq!(b.record_type(), FCGI_STDERR);
        assert_eq!(&b.content[..], b"de");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn response_reader_splits_stdout_and_stderr() {
        let end = EndRequest {
            app_status: 0,
            protocol_status: FCGI_REQUEST_COMPLETE,
        };
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_record(FCGI_STDOUT, b"Status: 200\r\n\r\n").unwrap());
        wire.extend_from_slice(&encode_record(FCGI_STDERR, b"PHP Notice: x\n").unwrap());
        wire.extend_from_slice(&encode_record(FCGI_STDOUT, b"body").unwrap());
        wire.extend_from_slice(&encode_stream(FCGI_STDOUT, &[]));
        wire.extend_from_slice(&encode_record(FCGI_END_REQUEST, &end.encode()).unwrap());
        wire.extend_from_slice(&encode_record(FCGI_STDOUT, b"next").unwrap());

        let mut reader = &wire[..];
        let mut response = ResponseReader::new(&mut reader);
        let mut stdout = Vec::new();
        while let Some(chunk) = response.next_stdout().await.unwrap() {
            stdout.extend_from_slice(&chunk);
        }
        assert_eq!(stdout, b"Status: 200\r\n\r\nbody");
        assert_eq!(response.finish().await.unwrap(), end);
        assert_eq!(response.stderr(), b"PHP Notice: x\n");

        // The following record is untouched.
        let next = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(&next.content[..], b"next");
    }

    #[tokio::test]
    async fn response_reader_rejects_unexpected_record_type() {
        let wire = encode_record(FCGI_PARAMS, b"x").unwrap();
        let mut reader = &wire[..];
        let mut response = ResponseReader::new(&mut reader);
        let err = response.next_stdout().await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn response_reader_requires_end_request() {
        let wire = encode_stream(FCGI_STDOUT, b"partial");
        let mut reader = &wire[..];
        let mut response = ResponseReader::new(&mut reader);
        assert!(response.next_stdout().await.unwrap().is_some());
        let err = response.next_stdout().await.unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEof("response")));
    }

    #[test]
    fn php_errors_are_detected_in_stderr() {
        let stderr = "PHP Notice:  Undefined index\nPHP Fatal error:  Call to undefined function f()\n";
        assert_eq!(
            check_php_error(stderr),
            Some("PHP Fatal error:  Call to undefined function f()")
        );
        assert_eq!(check_php_error("PHP Warning:  deprecated\n"), None);
        assert_eq!(check_php_error(""), None);
    }
}
