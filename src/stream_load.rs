use crate::config::{LoadFormat, SinkConfig};
use crate::endpoint::EndpointList;
use crate::error::{ConfigError, TransportError, TransportErrorKind};
use crate::format::{CSV_ENCLOSE, CSV_ESCAPE};
use crate::record::Destination;
use crate::transport::{LoadRequest, LoadResponse, PreparedLoad, Transport};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, EXPECT, LOCATION};
use reqwest::{redirect, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

/// Redirect hops followed per request (frontend → backend is one hop).
const MAX_REDIRECTS: usize = 3;

/// Body statuses that mean the rows are loaded.
const STATUS_SUCCESS: &str = "Success";
const STATUS_PUBLISH_TIMEOUT: &str = "Publish Timeout";
const STATUS_LABEL_EXISTS: &str = "Label Already Exists";

/// Stream load transport speaking the HTTP bulk-load protocol.
///
/// Each batch is `PUT` to `{node}/api/{db}/{table}/_stream_load` with basic
/// auth and the load options as headers. Redirects from the frontend to a
/// backend are followed manually so credentials survive the host change.
#[derive(Debug)]
pub struct StreamLoadTransport {
    client: Client,
    endpoints: EndpointList,
    username: String,
    password: String,
}

impl StreamLoadTransport {
    /// Construct a transport for the nodes and credentials in `config`.
    ///
    /// **Returns**
    /// - `Err(ConfigError)` if a node address is invalid or the HTTP client
    ///   cannot be built.
    pub fn new(config: &SinkConfig) -> Result<Self, ConfigError> {
        let endpoints = EndpointList::parse(&config.node_urls)?;
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "request_timeout_ms",
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(StreamLoadTransport {
            client,
            endpoints,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn endpoints(&self) -> &EndpointList {
        &self.endpoints
    }

    fn load_url(base: &str, destination: &Destination) -> String {
        format!(
            "{}/api/{}/{}/_stream_load",
            base,
            urlencoding::encode(&destination.database),
            urlencoding::encode(&destination.table)
        )
    }

    fn txn_url(base: &str, database: &str) -> String {
        format!("{}/api/{}/_stream_load_2pc", base, urlencoding::encode(database))
    }

    fn load_headers(request: &LoadRequest<'_>) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        insert_header(&mut headers, "label", request.label)?;
        insert_header(&mut headers, "format", request.format.as_str())?;
        match request.format {
            LoadFormat::Csv => {
                insert_header(&mut headers, "column_separator", request.column_separator)?;
                insert_header(&mut headers, "enclose", CSV_ENCLOSE)?;
                insert_header(&mut headers, "escape", CSV_ESCAPE)?;
            }
            LoadFormat::Json => insert_header(&mut headers, "read_json_by_line", "true")?,
        }
        if request.two_phase_commit {
            insert_header(&mut headers, "two_phase_commit", "true")?;
        }
        for (key, value) in request.options {
            insert_header(&mut headers, key, value)?;
        }
        Ok(headers)
    }

    /// Send a `PUT`, following redirects while keeping auth and headers.
    async fn put(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, TransportError> {
        let mut url = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let resp = self
                .authorized(self.client.put(&url))
                .headers(headers.clone())
                .body(body.to_vec())
                .send()
                .await
                .map_err(|e| classify_reqwest_error(&e))?;

            if !resp.status().is_redirection() {
                return Ok(resp);
            }
            url = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| TransportError::malformed("redirect without Location header"))?;
            tracing::debug!(location = %url, "following stream load redirect");
        }
        Err(TransportError::malformed("too many redirects"))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.username, Some(&self.password))
    }

    async fn load_once(&self, base: &str, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError> {
        let headers = Self::load_headers(request)?;
        let url = Self::load_url(base, request.destination);
        let resp = self.put(&url, &headers, request.payload).await?;

        let status = resp.status();
        let text = read_body(resp).await?;
        check_http_status(status, &text)?;
        classify_load_body(&text)
    }

    async fn txn_operation(&self, prepared: &PreparedLoad, operation: &str) -> Result<(), TransportError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "txn_id", &prepared.txn_id.to_string())?;
        insert_header(&mut headers, "txn_operation", operation)?;

        let mut last_err = None;
        for base in self.endpoints.rotation() {
            let url = Self::txn_url(base, &prepared.destination.database);
            let resp = match self.put(&url, &headers, &[]).await {
                Ok(resp) => resp,
                Err(e) if e.kind == TransportErrorKind::Connect => {
                    tracing::warn!(node = %base, error = %e, "stream load node unreachable, trying next");
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let status = resp.status();
            let text = read_body(resp).await?;
            check_http_status(status, &text)?;
            return classify_txn_body(&text);
        }
        Err(last_err.unwrap_or_else(|| TransportError::connect("no stream load nodes available")))
    }
}

#[async_trait]
impl Transport for StreamLoadTransport {
    async fn submit(&self, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError> {
        let mut last_err = None;
        for base in self.endpoints.rotation() {
            match self.load_once(base, request).await {
                Err(e) if e.kind == TransportErrorKind::Connect => {
                    tracing::warn!(node = %base, label = %request.label, error = %e, "stream load node unreachable, trying next");
                    last_err = Some(e);
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::connect("no stream load nodes available")))
    }

    async fn commit(&self, prepared: &PreparedLoad) -> Result<(), TransportError> {
        self.txn_operation(prepared, "commit").await
    }

    async fn abort(&self, prepared: &PreparedLoad) -> Result<(), TransportError> {
        self.txn_operation(prepared, "abort").await
    }
}

fn insert_header(headers: &mut HeaderMap, key: &str, value: &str) -> Result<(), TransportError> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| TransportError::malformed(format!("invalid load option name `{}`", key)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| TransportError::malformed(format!("invalid value for load option `{}`", key)))?;
    headers.insert(name, value);
    Ok(())
}

/// Map a client-side `reqwest` failure to a transport error kind.
pub(crate) fn classify_reqwest_error(error: &reqwest::Error) -> TransportError {
    let message = error.to_string();
    if error.is_timeout() {
        TransportError::timeout(message)
    } else if error.is_connect() {
        TransportError::connect(message)
    } else if error.is_builder() || error.is_redirect() || error.is_decode() {
        TransportError::malformed(message)
    } else {
        // Request or body I/O failed mid-flight; resending is safe under the same label.
        TransportError::connect(message)
    }
}

/// Read the whole response body. A body cut short is a network failure with
/// an unknown load outcome, never a malformed reply.
async fn read_body(resp: Response) -> Result<String, TransportError> {
    resp.text().await.map_err(|e| {
        if e.is_timeout() {
            TransportError::timeout(format!("reading response body: {}", e))
        } else {
            TransportError::connect(format!("reading response body: {}", e))
        }
    })
}

/// Map a non-success HTTP status to a transport error kind.
pub(crate) fn check_http_status(status: StatusCode, body: &str) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {}: {}", status, body);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::authentication(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => TransportError::server_busy(message),
        s if s.is_server_error() => TransportError::server_busy(message),
        _ => TransportError::rejected(message),
    })
}

#[derive(Debug, Deserialize)]
struct LoadBody {
    #[serde(rename = "Status", alias = "status")]
    status: String,
    #[serde(rename = "Message", alias = "msg", default)]
    message: Option<String>,
    #[serde(rename = "NumberLoadedRows", default)]
    loaded_rows: Option<u64>,
    #[serde(rename = "ExistingJobStatus", default)]
    existing_job_status: Option<String>,
    #[serde(rename = "TxnId", default)]
    txn_id: Option<i64>,
    #[serde(rename = "ErrorURL", default)]
    error_url: Option<String>,
}

impl LoadBody {
    fn describe(&self) -> String {
        let mut text = format!("status {}", self.status);
        if let Some(message) = &self.message {
            text.push_str(&format!(": {}", message));
        }
        if let Some(url) = &self.error_url {
            text.push_str(&format!(" (errors: {})", url));
        }
        text
    }
}

/// Interpret the JSON body of a stream load response.
pub(crate) fn classify_load_body(text: &str) -> Result<LoadResponse, TransportError> {
    let body: LoadBody = serde_json::from_str(text)
        .map_err(|e| TransportError::malformed(format!("unparseable load response ({}): {}", e, text)))?;

    match body.status.as_str() {
        STATUS_SUCCESS | STATUS_PUBLISH_TIMEOUT => Ok(LoadResponse {
            loaded_rows: body.loaded_rows,
            txn_id: body.txn_id,
            deduplicated: false,
        }),
        STATUS_LABEL_EXISTS => match body.existing_job_status.as_deref() {
            // An earlier attempt with this label went through; its ack was lost.
            Some("FINISHED") | Some("VISIBLE") | Some("COMMITTED") => Ok(LoadResponse {
                loaded_rows: None,
                txn_id: body.txn_id,
                deduplicated: true,
            }),
            Some("RUNNING") | Some("PREPARE") => Err(TransportError::server_busy(body.describe())),
            _ => Err(TransportError::label_conflict(body.describe())),
        },
        _ => Err(TransportError::rejected(body.describe())),
    }
}

fn classify_txn_body(text: &str) -> Result<(), TransportError> {
    let body: LoadBody = serde_json::from_str(text)
        .map_err(|e| TransportError::malformed(format!("unparseable transaction response ({}): {}", e, text)))?;
    if body.status == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(TransportError::rejected(body.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_success_bodies() {
        let ok = classify_load_body(r#"{"Status":"Success","NumberLoadedRows":3,"TxnId":11}"#).unwrap();
        assert_eq!(ok.loaded_rows, Some(3));
        assert_eq!(ok.txn_id, Some(11));
        assert!(!ok.deduplicated);

        assert!(classify_load_body(r#"{"Status":"Publish Timeout"}"#).is_ok());
    }

    #[test]
    fn test_label_exists_depends_on_existing_job() {
        let dup = classify_load_body(
            r#"{"Status":"Label Already Exists","ExistingJobStatus":"FINISHED"}"#,
        )
        .unwrap();
        assert!(dup.deduplicated);

        let running = classify_load_body(
            r#"{"Status":"Label Already Exists","ExistingJobStatus":"RUNNING"}"#,
        )
        .unwrap_err();
        assert_eq!(running.kind, TransportErrorKind::ServerBusy);

        let conflict = classify_load_body(r#"{"Status":"Label Already Exists"}"#).unwrap_err();
        assert_eq!(conflict.kind, TransportErrorKind::LabelConflict);
    }

    #[test]
    fn test_failed_and_garbage_bodies() {
        let fail = classify_load_body(
            r#"{"Status":"Fail","Message":"too many filtered rows","ErrorURL":"http://be/err"}"#,
        )
        .unwrap_err();
        assert_eq!(fail.kind, TransportErrorKind::Rejected);
        assert!(fail.message.contains("too many filtered rows"));
        assert!(fail.message.contains("http://be/err"));

        let garbage = classify_load_body("<html>oops</html>").unwrap_err();
        assert_eq!(garbage.kind, TransportErrorKind::Malformed);
    }

    #[test]
    fn test_http_status_classification() {
        assert!(check_http_status(StatusCode::OK, "").is_ok());
        let kind = |s| check_http_status(s, "").unwrap_err().kind;
        assert_eq!(kind(StatusCode::UNAUTHORIZED), TransportErrorKind::Authentication);
        assert_eq!(kind(StatusCode::FORBIDDEN), TransportErrorKind::Authentication);
        assert_eq!(kind(StatusCode::TOO_MANY_REQUESTS), TransportErrorKind::ServerBusy);
        assert_eq!(kind(StatusCode::SERVICE_UNAVAILABLE), TransportErrorKind::ServerBusy);
        assert_eq!(kind(StatusCode::BAD_REQUEST), TransportErrorKind::Rejected);
    }

    #[test]
    fn test_txn_body() {
        assert!(classify_txn_body(r#"{"status":"Success","msg":"transaction [1] commit successfully."}"#).is_ok());
        let err = classify_txn_body(r#"{"status":"Fail","msg":"txn not found"}"#).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Rejected);
    }

    #[test]
    fn test_load_headers() {
        let dest = Destination::new("db", "t");
        let options = BTreeMap::from([("strict_mode".to_string(), "true".to_string())]);
        let request = LoadRequest {
            destination: &dest,
            label: "l_0",
            format: LoadFormat::Json,
            column_separator: ",",
            payload: b"{}",
            rows: 1,
            options: &options,
            two_phase_commit: true,
        };
        let headers = StreamLoadTransport::load_headers(&request).unwrap();
        assert_eq!(headers.get("label").unwrap(), "l_0");
        assert_eq!(headers.get("format").unwrap(), "json");
        assert_eq!(headers.get("read_json_by_line").unwrap(), "true");
        assert_eq!(headers.get("two_phase_commit").unwrap(), "true");
        assert_eq!(headers.get("strict_mode").unwrap(), "true");
        assert!(headers.get("column_separator").is_none());
        assert!(headers.get("enclose").is_none());
    }

    #[test]
    fn test_csv_headers_declare_enclose_and_escape() {
        let dest = Destination::new("db", "t");
        let options = BTreeMap::from([("escape".to_string(), "\\".to_string())]);
        let request = LoadRequest {
            destination: &dest,
            label: "l_0",
            format: LoadFormat::Csv,
            column_separator: "\\x01",
            payload: b"a",
            rows: 1,
            options: &options,
            two_phase_commit: false,
        };
        let headers = StreamLoadTransport::load_headers(&request).unwrap();
        assert_eq!(headers.get("column_separator").unwrap(), "\\x01");
        assert_eq!(headers.get("enclose").unwrap(), "\"");
        // Explicit load options win over the defaults.
        assert_eq!(headers.get("escape").unwrap(), "\\");
    }

    #[test]
    fn test_load_url_encodes_names() {
        let url = StreamLoadTransport::load_url("http://fe:8030", &Destination::new("my db", "t"));
        assert_eq!(url, "http://fe:8030/api/my%20db/t/_stream_load");
    }
}
