//! Request capture.
//!
//! Every inbound request can be snapshotted into a [`CapturedRequest`] and
//! written as an indented JSON document to its own file. The file name is
//! derived from the arrival time (UTC, nanoseconds) and the method only, so
//! two requests with the same method arriving in the same nanosecond share a
//! name and the later write replaces the earlier one.
//!
//! The `Host` header is recorded in the `host` field and left out of
//! `headers`.

use crate::error::CaptureError;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::HOST;
use hyper::Request;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Snapshot of one inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    host: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    remote: String,

    url: String,

    #[serde(rename = "Method")]
    method: String,

    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,

    headers: BTreeMap<String, Vec<String>>,

    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_body",
        deserialize_with = "deserialize_body"
    )]
    body: Vec<u8>,
}

impl CapturedRequest {
    /// Snapshot `request`, keeping at most `max_body` bytes of its body.
    ///
    /// A longer body is truncated without error. The timestamp is taken
    /// before the body is read.
    pub async fn from_request<B>(
        request: Request<B>,
        remote: Option<SocketAddr>,
        max_body: u64,
    ) -> Result<Self, CaptureError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let timestamp = Utc::now();
        let (parts, body) = request.into_parts();

        let host = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned())
            })
            .unwrap_or_default();

        // Host is kept in its own field only.
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in parts.headers.iter().filter(|(name, _)| **name != HOST) {
            headers
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = read_body(body, max_body).await?;

        Ok(Self {
            host,
            remote: remote.map(|r| r.to_string()).unwrap_or_default(),
            url: parts.uri.to_string(),
            method: parts.method.to_string(),
            timestamp,
            headers,
            body,
        })
    }

    /// `<UTC date>T<HHMMSS>.<nanoseconds>.<method>`, e.g.
    /// `2006-01-02T150405.000000001.PUT`.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{:09}.{}",
            self.timestamp.format("%Y-%m-%dT%H%M%S"),
            self.timestamp.timestamp_subsec_nanos(),
            self.method
        )
    }

    /// Serialized document: one-space prefix, one-space indent.
    pub fn to_document(&self) -> Result<Vec<u8>, CaptureError> {
        let mut raw = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut raw, formatter);
        self.serialize(&mut serializer)?;

        let mut document = Vec::with_capacity(raw.len() + raw.len() / 8);
        for byte in raw {
            document.push(byte);
            if byte == b'\n' {
                document.push(b' ');
            }
        }
        Ok(document)
    }

    /// Write the serialized document to `sink`.
    pub fn write_to<W: Write>(&self, mut sink: W) -> Result<(), CaptureError> {
        sink.write_all(&self.to_document()?)?;
        sink.flush()?;
        Ok(())
    }

    /// Write the document to `dir/<file_name>` and return the path. An
    /// existing file with the same name is replaced.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf, CaptureError> {
        let path = dir.join(self.file_name());
        tokio::fs::write(&path, self.to_document()?).await?;
        Ok(path)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

async fn read_body<B>(body: B, max_body: u64) -> Result<Vec<u8>, CaptureError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let limit = usize::try_from(max_body).unwrap_or(usize::MAX);
    let mut body = std::pin::pin!(body);
    let mut buf = Vec::new();

    while buf.len() < limit {
        let Some(frame) = body.frame().await else {
            break;
        };
        let frame = frame.map_err(|e| CaptureError::Read(e.to_string()))?;
        // Trailers are not captured.
        if let Ok(data) = frame.into_data() {
            let take = data.len().min(limit - buf.len());
            buf.extend_from_slice(&data[..take]);
        }
    }

    Ok(buf)
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn serialize_body<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
}

fn deserialize_body<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(d)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http_body_util::Full;
    use hyper::body::Frame;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    const EXPECTED_DOCUMENT: &str = "{\n  \"host\": \"host1\",\n  \"remote\": \"192.0.2.1:1234\",\n  \"url\": \"http://host1/path1\",\n  \"Method\": \"PUT\",\n  \"timestamp\": \"1970-05-23T20:58:30.923Z\",\n  \"headers\": {\n   \"A\": [\n    \"b\"\n   ]\n  },\n  \"body\": \"MTIzNDU=\"\n }";

    fn put_request(body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method("PUT")
            .uri("http://host1/path1")
            .header("a", "b")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    fn remote() -> Option<SocketAddr> {
        Some("192.0.2.1:1234".parse().unwrap())
    }

    fn fixed_timestamp() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(12_344_310_923).unwrap()
    }

    async fn captured(max_body: u64) -> CapturedRequest {
        CapturedRequest::from_request(put_request(b"12345"), remote(), max_body)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_from_request() {
        let before = Utc::now();
        let c = captured(10_000).await;

        assert_eq!(c.method(), "PUT");
        assert_eq!(c.host(), "host1");
        assert_eq!(c.remote(), "192.0.2.1:1234");
        assert_eq!(c.url(), "http://host1/path1");
        assert_eq!(c.headers()["A"], vec!["b".to_string()]);
        assert_eq!(c.body(), b"12345");
        assert!(c.timestamp() >= before);
        assert!(Utc::now() - c.timestamp() < chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_from_request_truncates_body() {
        let c = captured(2).await;
        assert_eq!(c.method(), "PUT");
        assert_eq!(c.body(), b"12");

        let c = captured(0).await;
        assert!(c.body().is_empty());
    }

    #[tokio::test]
    async fn test_from_request_truncates_across_frames() {
        let body = ChunkedBody::new(vec![Ok(&b"abc"[..]), Ok(&b"def"[..]), Ok(&b"ghi"[..])]);
        let request = Request::builder().method("POST").uri("/x").body(body).unwrap();

        let c = CapturedRequest::from_request(request, None, 5).await.unwrap();
        assert_eq!(c.body(), b"abcde");
        assert_eq!(c.remote(), "");
    }

    #[tokio::test]
    async fn test_from_request_read_error() {
        let body = ChunkedBody::new(vec![
            Ok(&b"abc"[..]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let request = Request::builder().method("POST").uri("/x").body(body).unwrap();

        let result = CapturedRequest::from_request(request, None, 1024).await;
        assert!(matches!(result, Err(CaptureError::Read(_))));
    }

    #[tokio::test]
    async fn test_host_from_header() {
        let request = Request::builder()
            .method("GET")
            .uri("/path?q=1")
            .header("host", "example.com:8080")
            .header("x-multi", "1")
            .header("x-multi", "2")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let c = CapturedRequest::from_request(request, None, 10).await.unwrap();
        assert_eq!(c.host(), "example.com:8080");
        assert_eq!(c.url(), "/path?q=1");
        assert_eq!(c.headers()["X-Multi"], vec!["1", "2"]);
        assert!(c.body().is_empty());
    }

    #[tokio::test]
    async fn test_host_header_left_out_of_headers() {
        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header("host", "example.com")
            .header("accept", "*/*")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let c = CapturedRequest::from_request(request, None, 10).await.unwrap();
        assert_eq!(c.host(), "example.com");
        assert!(!c.headers().contains_key("Host"));
        assert_eq!(c.headers().len(), 1);
        assert_eq!(c.headers()["Accept"], vec!["*/*"]);

        let document = String::from_utf8(c.to_document().unwrap()).unwrap();
        assert!(!document.contains("\"Host\""));
    }

    #[test]
    fn test_file_name() {
        let c = CapturedRequest {
            host: String::new(),
            remote: String::new(),
            url: String::new(),
            method: "M123".to_string(),
            timestamp: fixed_timestamp(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        assert_eq!(c.file_name(), "1970-05-23T205830.923000000.M123");

        let mut c = c;
        c.method = "PUT".to_string();
        c.timestamp = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap()
            + chrono::Duration::nanoseconds(1);
        assert_eq!(c.file_name(), "2006-01-02T150405.000000001.PUT");
    }

    #[test]
    fn test_file_name_collides_for_same_instant_and_method() {
        // Same method and nanosecond: same file, the later write wins.
        let a = CapturedRequest {
            host: "a".to_string(),
            remote: String::new(),
            url: "/a".to_string(),
            method: "GET".to_string(),
            timestamp: fixed_timestamp(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        let mut b = a.clone();
        b.url = "/b".to_string();
        assert_eq!(a.file_name(), b.file_name());

        b.method = "POST".to_string();
        assert_ne!(a.file_name(), b.file_name());
    }

    #[tokio::test]
    async fn test_write_to() {
        let mut c = captured(10_000).await;
        c.timestamp = fixed_timestamp();

        let mut out = Vec::new();
        c.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), EXPECTED_DOCUMENT);
    }

    #[tokio::test]
    async fn test_empty_fields_are_omitted() {
        let request = Request::builder()
            .method("GET")
            .uri("/only-path")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let c = CapturedRequest::from_request(request, None, 100).await.unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&c.to_document().unwrap()).unwrap();
        let object = doc.as_object().unwrap();
        assert!(!object.contains_key("host"));
        assert!(!object.contains_key("remote"));
        assert!(!object.contains_key("body"));
        assert_eq!(object["url"], "/only-path");
        assert_eq!(object["Method"], "GET");
        assert_eq!(object["headers"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_document_reads_back() {
        let c = captured(10_000).await;
        let parsed: CapturedRequest = serde_json::from_slice(&c.to_document().unwrap()).unwrap();

        assert_eq!(parsed.body(), b"12345");
        assert_eq!(parsed.host(), c.host());
        assert_eq!(parsed.headers(), c.headers());
        // Millisecond precision on the wire.
        assert_eq!(
            parsed.timestamp().timestamp_millis(),
            c.timestamp().timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_save_to() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = captured(10_000).await;
        c.timestamp = fixed_timestamp();

        let path = c.save_to(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join(c.file_name()));

        let actual = std::fs::read_to_string(&path).unwrap();
        assert_eq!(actual, EXPECTED_DOCUMENT);
    }

    #[tokio::test]
    async fn test_save_to_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let c = captured(10_000).await;

        let result = c.save_to(&dir.path().join("missing")).await;
        assert!(matches!(result, Err(CaptureError::Write(_))));
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("a"), "A");
        assert_eq!(canonical_header_name("www-AUTHENTICATE"), "Www-Authenticate");
    }

    /// Body yielding one data frame per chunk, or an error.
    struct ChunkedBody(VecDeque<Result<Bytes, std::io::Error>>);

    impl ChunkedBody {
        fn new(chunks: Vec<Result<&'static [u8], std::io::Error>>) -> Self {
            Self(
                chunks
                    .into_iter()
                    .map(|c| c.map(Bytes::from_static))
                    .collect(),
            )
        }
    }

    impl Body for ChunkedBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            Poll::Ready(self.0.pop_front().map(|chunk| chunk.map(Frame::data)))
        }
    }
}
