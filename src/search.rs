//! Search cluster client implementing the index-replacement bulk-load protocol.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::record::IndexIdentity;

/// Blocking HTTP client for the document search cluster.
pub struct SearchClient {
    client: Client,
    base: Url,
    max_retries: usize,
}

impl SearchClient {
    /// Builds a new cluster client.
    ///
    /// # Arguments
    /// * `endpoint` - Cluster base URL, e.g. `http://localhost:9200`
    /// * `timeout` - Per-request deadline
    /// * `max_retries` - Attempt budget for transient transport errors
    pub fn new(endpoint: &str, timeout: Duration, max_retries: usize) -> Result<Self> {
        let base = Url::parse(endpoint).context("search endpoint must be an absolute URL")?;
        anyhow::ensure!(
            matches!(base.scheme(), "http" | "https"),
            "search endpoint must be an http(s) URL"
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build search HTTP client")?;
        Ok(Self {
            client,
            base,
            max_retries: max_retries.max(1),
        })
    }

    /// Deletes the named index. A missing index is success, not an error.
    /// Returns whether an index was actually removed.
    pub fn delete_index(&self, name: &str) -> Result<bool> {
        let url = self.index_url(name)?;
        let response = self.execute(self.client.delete(url))?;
        let status = response.status();
        if status.is_success() {
            info!(index = name, "deleted existing index");
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            debug!(index = name, "no existing index to delete");
            return Ok(false);
        }
        let body = read_body(response);
        anyhow::bail!("failed to delete index {name} ({status}): {body}");
    }

    /// Creates a fresh, empty index with the given name.
    pub fn create_index(&self, name: &str) -> Result<()> {
        let url = self.index_url(name)?;
        let response = self.execute(self.client.put(url))?;
        let status = response.status();
        if status.is_success() {
            info!(index = name, "created index");
            return Ok(());
        }
        let body = read_body(response);
        anyhow::bail!("failed to create index {name} ({status}): {body}");
    }

    /// Submits one batch of documents through the bulk endpoint.
    ///
    /// Per-record rejections (documents whose shape conflicts with the
    /// index's inferred mapping) are reported in the outcome and do not fail
    /// the batch; only transport-level errors surface as `Err`.
    pub fn bulk_index<T>(&self, name: &str, doc_type: &str, records: &[T]) -> Result<BulkOutcome<T>>
    where
        T: Serialize + Clone,
    {
        if records.is_empty() {
            return Ok(BulkOutcome::empty());
        }
        let body = bulk_body(records)?;
        let url = self.bulk_url(name, doc_type)?;
        let response = self.execute(
            self.client
                .post(url)
                .header(CONTENT_TYPE, "application/x-ndjson")
                .body(body),
        )?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response);
            anyhow::bail!("bulk submission to {name} failed ({status}): {body}");
        }
        let payload: BulkResponse = response
            .json()
            .context("failed to parse bulk response payload")?;
        Ok(collect_outcome(records, &payload))
    }

    fn index_url(&self, name: &str) -> Result<Url> {
        self.base
            .join(name)
            .with_context(|| format!("invalid index name {name:?}"))
    }

    fn bulk_url(&self, name: &str, doc_type: &str) -> Result<Url> {
        self.base
            .join(&format!("{name}/{doc_type}/_bulk"))
            .with_context(|| format!("invalid bulk path for index {name:?}"))
    }

    fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let mut attempt = 0usize;
        loop {
            let next = request
                .try_clone()
                .context("search request body is not replayable")?;
            match next.send() {
                Ok(response) => {
                    let status = response.status();
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, "transient cluster response, retrying");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if (err.is_connect() || err.is_timeout() || err.is_request())
                        && attempt + 1 < self.max_retries
                    {
                        attempt += 1;
                        warn!(%err, attempt, "search cluster unreachable, retrying");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err).context("search cluster request failed");
                }
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

fn read_body(response: Response) -> String {
    response
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string())
}

/// Newline-delimited bulk payload: one action line per document.
fn bulk_body<T: Serialize>(records: &[T]) -> Result<String> {
    let mut body = String::new();
    for record in records {
        body.push_str("{\"index\":{}}\n");
        let doc = serde_json::to_string(record).context("failed to serialize record")?;
        body.push_str(&doc);
        body.push('\n');
    }
    Ok(body)
}

/// Per-batch accept/reject tally.
#[derive(Debug)]
pub struct BulkOutcome<T> {
    /// Documents the cluster accepted.
    pub accepted: usize,
    /// Documents the cluster rejected, in submission order.
    pub rejected: Vec<T>,
}

impl<T> BulkOutcome<T> {
    fn empty() -> Self {
        Self {
            accepted: 0,
            rejected: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(alias = "create")]
    index: Option<BulkItemStatus>,
}

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    #[serde(default)]
    status: u16,
    error: Option<serde_json::Value>,
}

fn collect_outcome<T: Clone>(records: &[T], response: &BulkResponse) -> BulkOutcome<T> {
    let mut outcome = BulkOutcome::empty();
    if !response.errors && response.items.len() != records.len() {
        // Clusters that elide per-item detail report plain success.
        outcome.accepted = records.len();
        return outcome;
    }
    for (position, record) in records.iter().enumerate() {
        let rejected = response
            .items
            .get(position)
            .and_then(|item| item.index.as_ref())
            .map(|status| status.error.is_some() || status.status >= 400)
            .unwrap_or(false);
        if rejected {
            outcome.rejected.push(record.clone());
        } else {
            outcome.accepted += 1;
        }
    }
    outcome
}

/// Result of one index replacement.
#[derive(Debug)]
pub struct ReplaceReport<T> {
    /// The index that was replaced.
    pub index: String,
    /// False when any submission was partially rejected.
    pub success: bool,
    /// Documents accepted across all batches.
    pub indexed: usize,
    /// Documents rejected across all batches.
    pub rejected: Vec<T>,
}

/// Drives the delete-if-exists, create, bulk-load protocol for one index.
pub struct IndexReplacer {
    client: SearchClient,
    batch_size: usize,
}

impl IndexReplacer {
    /// Wraps a cluster client with a bulk batch size.
    pub fn new(client: SearchClient, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
        }
    }

    /// Deletes any prior index with this name and creates a fresh one.
    pub fn prepare(&self, name: &str) -> Result<()> {
        self.client.delete_index(name)?;
        self.client.create_index(name)
    }

    /// Streams records into a prepared index in bounded batches.
    ///
    /// Rejections accumulate in the outcome; indexing continues for the
    /// remaining batches.
    pub fn load<T, I>(&self, name: &str, doc_type: &str, records: I) -> Result<BulkOutcome<T>>
    where
        T: Serialize + Clone,
        I: IntoIterator<Item = T>,
    {
        let mut outcome = BulkOutcome::empty();
        let mut batch = Vec::with_capacity(self.batch_size);
        for record in records {
            batch.push(record);
            if batch.len() >= self.batch_size {
                self.submit(name, doc_type, &mut batch, &mut outcome)?;
            }
        }
        self.submit(name, doc_type, &mut batch, &mut outcome)?;
        Ok(outcome)
    }

    /// Full replacement protocol for an arbitrary index name.
    pub fn replace_named<T, I>(
        &self,
        name: &str,
        doc_type: &str,
        records: I,
    ) -> Result<ReplaceReport<T>>
    where
        T: Serialize + Clone,
        I: IntoIterator<Item = T>,
    {
        self.prepare(name)?;
        let outcome = self.load(name, doc_type, records)?;
        Ok(ReplaceReport {
            index: name.to_string(),
            success: outcome.rejected.is_empty(),
            indexed: outcome.accepted,
            rejected: outcome.rejected,
        })
    }

    /// Full replacement protocol for an ingestion-run identity.
    pub fn replace_index<T, I>(
        &self,
        identity: &IndexIdentity,
        records: I,
    ) -> Result<ReplaceReport<T>>
    where
        T: Serialize + Clone,
        I: IntoIterator<Item = T>,
    {
        self.replace_named(
            &identity.index_name(),
            identity.log_type().as_str(),
            records,
        )
    }

    fn submit<T>(
        &self,
        name: &str,
        doc_type: &str,
        batch: &mut Vec<T>,
        outcome: &mut BulkOutcome<T>,
    ) -> Result<()>
    where
        T: Serialize + Clone,
    {
        if batch.is_empty() {
            return Ok(());
        }
        let result = self.client.bulk_index(name, doc_type, batch)?;
        if !result.rejected.is_empty() {
            warn!(
                index = name,
                rejected = result.rejected.len(),
                "cluster rejected records in batch"
            );
        }
        outcome.accepted += result.accepted;
        outcome.rejected.extend(result.rejected);
        batch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn bulk_body_pairs_action_and_document_lines() {
        let records = vec![json!({"a": 1}), json!({"b": 2})];
        let body = bulk_body(&records).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "{\"index\":{}}");
        assert_eq!(lines[1], "{\"a\":1}");
        assert_eq!(lines[2], "{\"index\":{}}");
    }

    #[test]
    fn partial_rejections_are_collected_not_fatal() {
        let payload: BulkResponse = serde_json::from_str(
            r#"{
                "errors": true,
                "items": [
                    {"index": {"status": 201}},
                    {"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}
                ]
            }"#,
        )
        .unwrap();
        let records = vec![json!({"ok": 1}), json!({"bad": 2})];
        let outcome = collect_outcome(&records, &payload);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected, vec![json!({"bad": 2})]);
    }

    #[test]
    fn success_without_item_detail_accepts_everything() {
        let payload: BulkResponse = serde_json::from_str(r#"{"errors": false}"#).unwrap();
        let records = vec![json!({"a": 1}), json!({"b": 2})];
        let outcome = collect_outcome(&records, &payload);
        assert_eq!(outcome.accepted, 2);
        assert!(outcome.rejected.is_empty());
    }

    // Minimal in-process cluster stub speaking just enough HTTP for the
    // delete/create/bulk protocol, backed by an index -> documents map.

    type Indices = Arc<Mutex<BTreeMap<String, Vec<Value>>>>;
    type RequestLog = Arc<Mutex<Vec<String>>>;

    fn spawn_stub() -> (String, Indices, RequestLog) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let indices: Indices = Arc::new(Mutex::new(BTreeMap::new()));
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        {
            let indices = Arc::clone(&indices);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let indices = Arc::clone(&indices);
                    let log = Arc::clone(&log);
                    thread::spawn(move || serve(stream, indices, log));
                }
            });
        }
        (format!("http://{addr}"), indices, log)
    }

    fn serve(stream: TcpStream, indices: Indices, log: RequestLog) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                return;
            }
            let request_line = request_line.trim().to_string();
            if request_line.is_empty() {
                continue;
            }
            let mut content_length = 0usize;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 {
                    return;
                }
                let header = header.trim().to_ascii_lowercase();
                if header.is_empty() {
                    break;
                }
                if let Some(value) = header.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut body = vec![0u8; content_length];
            if content_length > 0 && reader.read_exact(&mut body).is_err() {
                return;
            }
            let body = String::from_utf8_lossy(&body).into_owned();

            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("").to_string();
            let path = parts
                .next()
                .unwrap_or("")
                .trim_start_matches('/')
                .to_string();
            let (status, reply) = route(&method, &path, &body, &indices);
            log.lock().unwrap().push(format!("{method} /{path} -> {status}"));
            let _ = write!(
                stream,
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{reply}",
                reply.len()
            );
        }
    }

    fn route(method: &str, path: &str, body: &str, indices: &Indices) -> (u16, String) {
        let mut indices = indices.lock().unwrap();
        match method {
            "DELETE" => {
                if indices.remove(path).is_some() {
                    (200, json!({"acknowledged": true}).to_string())
                } else {
                    (404, json!({"error": "index_not_found_exception"}).to_string())
                }
            }
            "PUT" => {
                indices.insert(path.to_string(), Vec::new());
                (200, json!({"acknowledged": true}).to_string())
            }
            "POST" => {
                let index = path.split('/').next().unwrap_or_default().to_string();
                let docs: Vec<Value> = body
                    .lines()
                    .enumerate()
                    .filter(|(position, _)| position % 2 == 1)
                    .map(|(_, line)| serde_json::from_str(line).unwrap())
                    .collect();
                let items: Vec<Value> =
                    docs.iter().map(|_| json!({"index": {"status": 201}})).collect();
                indices.entry(index).or_default().extend(docs);
                (200, json!({"errors": false, "items": items}).to_string())
            }
            _ => (400, json!({"error": "unsupported"}).to_string()),
        }
    }

    #[test]
    fn replace_twice_leaves_exactly_one_copy_of_each_record() {
        let (endpoint, indices, log) = spawn_stub();
        let client = SearchClient::new(&endpoint, Duration::from_secs(5), 1).unwrap();
        let replacer = IndexReplacer::new(client, 2);
        let records = vec![
            json!({"test": "a"}),
            json!({"test": "b"}),
            json!({"test": "c"}),
        ];

        let first = replacer
            .replace_named("ckcm_1.0_m_c_1", "ckcm", records.clone())
            .unwrap();
        assert!(first.success);
        assert_eq!(first.indexed, 3);

        let second = replacer
            .replace_named("ckcm_1.0_m_c_1", "ckcm", records.clone())
            .unwrap();
        assert!(second.success);
        assert_eq!(second.indexed, 3);

        let stored = indices.lock().unwrap();
        assert_eq!(stored.get("ckcm_1.0_m_c_1").map(Vec::len), Some(3));

        let requests = log.lock().unwrap();
        // First run finds nothing to delete; the second removes the index the
        // first one created.
        assert_eq!(requests[0], "DELETE /ckcm_1.0_m_c_1 -> 404");
        assert!(requests
            .iter()
            .skip(3)
            .any(|entry| entry == "DELETE /ckcm_1.0_m_c_1 -> 200"));
    }

    #[test]
    fn missing_index_delete_is_not_an_error() {
        let (endpoint, _indices, _log) = spawn_stub();
        let client = SearchClient::new(&endpoint, Duration::from_secs(5), 1).unwrap();
        assert!(!client.delete_index("never_created").unwrap());
    }
}
