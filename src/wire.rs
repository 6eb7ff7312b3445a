//! HTTP/1.1 wire form of responses stored in the mock cache.

use std::{
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use bytes::{Bytes, BytesMut};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING},
    Response, StatusCode, Version,
};

use crate::{Error, Result};

const POOL_CAPACITY: usize = 64;
const INITIAL_BUFFER_SIZE: usize = 4 * 1024;

static RESPONSE_BUFFERS: BufferPool = BufferPool::new(POOL_CAPACITY);

/// Free list of serialization buffers.
pub(crate) struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
}

impl BufferPool {
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes an empty buffer from the pool, allocating when none is free.
    pub(crate) fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_BUFFER_SIZE));
        PooledBuffer { pool: self, buf }
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

/// Buffer checked out of a [`BufferPool`]; returned on drop.
pub(crate) struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: BytesMut,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// Reads the full response and dumps it as HTTP/1.1 wire bytes.
pub async fn dump_response(response: Response) -> Result<Bytes> {
    let version = response.version();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(encode_response(version, status, &headers, &body))
}

/// Serializes a status line, headers and body.
///
/// Framing headers are rewritten: the body is always sent with an explicit
/// `Content-Length`.
pub fn encode_response(
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Bytes {
    let mut buf = RESPONSE_BUFFERS.get();

    buf.extend_from_slice(version_str(version).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    buf.extend_from_slice(body);

    Bytes::copy_from_slice(&buf)
}

/// Parses wire bytes produced by [`encode_response`].
pub fn decode_response(raw: &Bytes) -> Result<http::Response<Bytes>> {
    let head_end = find_head_end(raw)
        .ok_or_else(|| Error::Wire("missing end of response head".to_owned()))?;
    let mut lines = raw[..head_end]
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let status_line = lines
        .next()
        .ok_or_else(|| Error::Wire("missing status line".to_owned()))?;
    let (version, status) = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| Error::Wire(format!("malformed header line: {}", lossy(line))))?;
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|err| Error::Wire(format!("invalid header name: {err}")))?;
        let value = HeaderValue::from_bytes(trim_ows(&line[colon + 1..]))
            .map_err(|err| Error::Wire(format!("invalid header value for {name}: {err}")))?;
        headers.append(name, value);
    }

    let mut body = raw.slice(head_end + 4..);
    if let Some(length) = headers.get(CONTENT_LENGTH) {
        let length = length
            .to_str()
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| Error::Wire("invalid content-length".to_owned()))?;
        if body.len() < length {
            return Err(Error::Wire(format!(
                "truncated body: expected {length} bytes, got {}",
                body.len()
            )));
        }
        body.truncate(length);
    }

    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    Ok(response)
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::Wire("status line is not valid UTF-8".to_owned()))?;
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/0.9") => Version::HTTP_09,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/2" | "HTTP/2.0") => Version::HTTP_2,
        Some("HTTP/3" | "HTTP/3.0") => Version::HTTP_3,
        _ => return Err(Error::Wire(format!("unsupported status line: {line}"))),
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| Error::Wire(format!("invalid status code in: {line}")))?;
    Ok((version, status))
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Strips optional whitespace (SP / HTAB) around a header value.
fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use reqwest::{
        header::{HeaderMap, HeaderValue, CONTENT_TYPE, TRANSFER_ENCODING},
        Response, StatusCode, Version,
    };

    use super::{decode_response, dump_response, encode_response, BufferPool};
    use crate::Error;

    #[test]
    fn encoded_response_parses_back_to_same_parts() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let raw = encode_response(
            Version::HTTP_11,
            StatusCode::CREATED,
            &headers,
            br#"{"id":7}"#,
        );
        assert!(raw.starts_with(b"HTTP/1.1 201 Created\r\n"));

        let parsed = decode_response(&raw).unwrap();
        assert_eq!(parsed.status(), StatusCode::CREATED);
        assert_eq!(parsed.version(), Version::HTTP_11);
        assert_eq!(parsed.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(parsed.headers().get_all("set-cookie").iter().count(), 2);
        assert!(parsed.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(parsed.headers()["content-length"], "8");
        assert_eq!(parsed.body().as_ref(), br#"{"id":7}"#);
    }

    #[tokio::test]
    async fn dump_reads_the_whole_body() {
        let response = Response::from(
            http::Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("retry-after", "3")
                .body("down for maintenance")
                .unwrap(),
        );
        let raw = dump_response(response).await.unwrap();
        let parsed = decode_response(&raw).unwrap();
        assert_eq!(parsed.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(parsed.headers()["retry-after"], "3");
        assert_eq!(parsed.body().as_ref(), b"down for maintenance");
    }

    #[test]
    fn rejects_truncated_body() {
        let raw = Bytes::from_static(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nshort");
        assert!(matches!(decode_response(&raw), Err(Error::Wire(_))));
    }

    #[test]
    fn rejects_garbage() {
        for raw in [
            &b"not http at all"[..],
            b"SPDY/9 200 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nno-colon-here\r\n\r\n",
        ] {
            let raw = Bytes::copy_from_slice(raw);
            assert!(decode_response(&raw).is_err(), "{raw:?}");
        }
    }

    #[test]
    fn pool_reuses_cleared_buffers() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"leftover");
        }
        assert_eq!(pool.free_len(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.free_len(), 0);

        let extra = pool.get();
        drop(buf);
        drop(extra);
        assert_eq!(pool.free_len(), 1);
    }
}
