use std::{
    collections::{BTreeMap, HashSet},
    error::Error as StdError,
    panic::Location,
    time::Duration,
};

use actix_http::Version;
use actix_web::HttpRequest;
use actix_web::http::{StatusCode, header, header::HeaderMap};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{
    OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};
use uuid::Uuid;

use crate::error::SetupError;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Static assets are not worth an access record.
const ASSET_PATTERN: &str = r"\.(?:js|css|png|ico|bmp|jpg|jpeg|gif|webp|jpe)\b";
const REDIRECT_PATTERN: &str = r"/redirect?.";

/// Header values never written to disk.
const REDACTED_HEADERS: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];
const REDACTED: &str = "[redacted]";

/// Cookie carrying the client identifier.
const UID_COOKIE: &str = "uid";

pub(crate) fn now(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Current time at `offset` as `YYYY-MM-DD HH:MM:SS`.
pub fn timestamp(offset: UtcOffset) -> String {
    now(offset).format(TIMESTAMP_FORMAT).unwrap_or_default()
}

/// Captured body: JSON when it parses, text otherwise.
fn decode_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    let value = serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
    Some(value)
}

/// One entry of a severity file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Filled in by the sink at write time.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
}

/// What a record is built from, besides the request context.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub error: Option<ErrorDetail>,
    pub message: Option<Value>,
    pub response_time: Option<Duration>,
    /// Include the request and response snapshots.
    pub verbose_detail: bool,
}

/// Request and response as seen by the middleware.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub request: RequestDetail,
    pub response: Option<ResponseDetail>,
}

impl LogRecord {
    /// Builds a record bound to a request. Request and response details are
    /// only attached when `capture.verbose_detail` is set.
    pub fn from_context(ctx: &Snapshot, capture: Capture) -> Self {
        let verbose = capture.verbose_detail;
        let mut record = LogRecord::from_default(capture);
        if verbose {
            record.request = Some(ctx.request.clone());
            record.response = ctx.response.clone();
        }
        record
    }

    /// Builds a record without any request context.
    pub fn from_default(capture: Capture) -> Self {
        let (response_time_ms, response_time) = match capture.response_time {
            Some(elapsed) => (
                Some(elapsed.as_millis() as u64),
                Some(humanize_duration(elapsed)),
            ),
            None => (None, None),
        };
        LogRecord {
            timestamp: String::new(),
            message: capture.message,
            error: capture.error,
            request: None,
            response: None,
            response_time_ms,
            response_time,
        }
    }
}

/// `12ms`, `1,204ms`, or whole seconds from ten seconds on.
pub fn humanize_duration(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 10_000 {
        format!("{}ms", group_thousands(millis))
    } else {
        let secs = (millis + 500) / 1000;
        format!("{}s", group_thousands(secs))
    }
}

fn group_thousands(n: u128) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Normalizes a free-form message.
///
/// Objects, strings, numbers and booleans pass through, sequences are joined
/// with `,`, and null or unserializable input gives no message at all.
pub fn handle_message<T: Serialize + ?Sized>(message: &T) -> Option<Value> {
    match serde_json::to_value(message) {
        Ok(Value::Null) | Err(_) => None,
        Ok(Value::Array(items)) => Some(Value::String(
            items.iter().map(join_item).collect::<Vec<_>>().join(","),
        )),
        Ok(value) => Some(value),
    }
}

fn join_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalized error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub name: String,
    pub message: String,
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ErrorDetail {
    /// Captures type name, message and the `source()` chain of `err`.
    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        let name = std::any::type_name::<E>().to_string();
        let message = err.to_string();
        let mut stack = format!("{name}: {message}");
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        ErrorDetail {
            name,
            message,
            stack,
            file: None,
            line: None,
            column: None,
        }
    }

    /// Captures an error that reached the middleware. The name is the leading
    /// type name of its debug form, or `Error` when it has none.
    pub fn from_actix(err: &actix_web::Error) -> Self {
        let debug = format!("{err:?}");
        let name: String = debug
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        ErrorDetail {
            name: if name.is_empty() {
                "Error".to_string()
            } else {
                name
            },
            message: err.to_string(),
            stack: debug,
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn with_location(mut self, location: &Location<'_>) -> Self {
        self.file = Some(location.file().to_string());
        self.line = Some(location.line());
        self.column = Some(location.column());
        self
    }
}

/// Normalizes an optional error; `None` leaves the record without one.
#[track_caller]
pub fn handle_error<E: StdError + ?Sized>(err: Option<&E>) -> Option<ErrorDetail> {
    let location = Location::caller();
    err.map(|err| ErrorDetail::from_error(err).with_location(location))
}

/// Request identifier, taken from the `x-request-id` header or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub(crate) fn new() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        {
            Self(Uuid::new_v4().as_hyphenated().to_string())
        }
        #[cfg(feature = "uuid_v7")]
        {
            Self(Uuid::now_v7().as_hyphenated().to_string())
        }
    }

    pub(crate) fn from_request(req: &HttpRequest) -> Self {
        match req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
        {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request metadata of an access or failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetail {
    pub id: String,
    pub method: String,
    pub url: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    pub protocol: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Payload read by the handler, only with `record_body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestDetail {
    pub fn from_request(req: &HttpRequest, id: &RequestId) -> Self {
        let conn = req.connection_info();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let ips = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        RequestDetail {
            id: id.as_str().to_string(),
            method: req.method().to_string(),
            url: format!("{}://{}{}", conn.scheme(), conn.host(), path_and_query),
            path: req.path().to_string(),
            query: req.query_string().to_string(),
            headers: header_map(req.headers()),
            ip: conn.realip_remote_addr().map(str::to_string),
            ips,
            protocol: conn.scheme().to_string(),
            version: version_name(req.version()).to_string(),
            uid: req.cookie(UID_COOKIE).map(|c| c.value().to_string()),
            body: None,
        }
    }

    pub(crate) fn set_body(&mut self, body: &[u8]) {
        self.body = decode_body(body);
    }
}

fn version_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "unknown",
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        let value = if REDACTED_HEADERS.contains(&name) {
            REDACTED
        } else {
            value.to_str().unwrap_or_default()
        };
        map.entry(name.to_string())
            .and_modify(|existing| {
                if existing.as_str() != REDACTED {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// Response metadata of an access or failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDetail {
    pub status_code: u16,
    pub status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ResponseDetail {
    pub fn from_parts(status: StatusCode, headers: &HeaderMap) -> Self {
        ResponseDetail {
            status_code: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            size: None,
            body: None,
        }
    }

    pub(crate) fn set_body(&mut self, body: &[u8]) {
        self.body = decode_body(body);
    }
}

/// URLs that never produce an access record.
///
/// Always contains the asset and redirect patterns; extra exact paths and
/// patterns come from [`Options`](crate::Options).
#[derive(Debug, Clone)]
pub struct ExcludeFilter {
    paths: HashSet<String>,
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    pub fn new(paths: Vec<String>, patterns: &[String]) -> Result<Self, SetupError> {
        let mut compiled = Vec::with_capacity(patterns.len() + 2);
        for pattern in [ASSET_PATTERN, REDIRECT_PATTERN] {
            compiled.push(RegexBuilder::new(pattern).case_insensitive(true).build()?);
        }
        for pattern in patterns {
            compiled.push(Regex::new(pattern)?);
        }
        Ok(ExcludeFilter {
            paths: paths.into_iter().collect(),
            patterns: compiled,
        })
    }

    /// `path` is matched exactly, `url` (path and query) against the patterns.
    pub fn is_excluded(&self, path: &str, url: &str) -> bool {
        self.paths.contains(path) || self.patterns.iter().any(|r| r.is_match(url))
    }
}
