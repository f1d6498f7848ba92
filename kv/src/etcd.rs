// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the etcd v2 keys API
//!
//! Requests map onto `/v2/keys/<key>`:
//!
//! | operation          | request                                       |
//! |--------------------|-----------------------------------------------|
//! | get / list         | `GET`                                         |
//! | set                | `PUT value=..[&ttl=..]`                       |
//! | create             | `PUT ..&prevExist=false`                      |
//! | compare-and-swap   | `PUT ..&prevIndex=N`                          |
//! | delete             | `DELETE [?recursive=true]`                    |
//! | compare-and-delete | `DELETE ?prevIndex=N`                         |
//! | head index         | `GET /` (the `X-Etcd-Index` header)           |
//! | watch              | `GET ?wait=true&recursive=true&waitIndex=N`   |
//!
//! A watch is a sequence of long polls, each returning one change.  etcd
//! closes idle long polls after a while; the stream just issues the next one
//! from the same index.

use crate::normalize_prefix;
use crate::Error;
use crate::EventKind;
use crate::KvNode;
use crate::KvStore;
use crate::KvValue;
use crate::WatchEvent;
use crate::WatchStream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use slog::{debug, o, Logger};
use std::time::Duration;

// etcd v2 error codes
const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_TEST_FAILED: u64 = 101;
const ERROR_NOT_FILE: u64 = 102;
const ERROR_NODE_EXIST: u64 = 105;
const ERROR_EVENT_INDEX_CLEARED: u64 = 401;

const INDEX_HEADER: &str = "X-Etcd-Index";

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
    #[serde(rename = "prevNode")]
    prev_node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl EtcdError {
    fn into_error(self, key: &str) -> Error {
        match self.error_code {
            ERROR_KEY_NOT_FOUND => Error::NotFound { key: key.to_string() },
            ERROR_TEST_FAILED | ERROR_NODE_EXIST => Error::Conflict {
                key: key.to_string(),
                reason: format!("{} ({})", self.message, self.cause),
            },
            ERROR_NOT_FILE => Error::IsDirectory { key: key.to_string() },
            ERROR_EVENT_INDEX_CLEARED => {
                Error::IndexCleared { index: self.index }
            }
            code => Error::Store {
                code,
                message: self.message,
                cause: self.cause,
            },
        }
    }
}

/// [`KvStore`] backed by an etcd cluster member
#[derive(Clone)]
pub struct EtcdKv {
    log: Logger,
    endpoint: String,
    client: reqwest::Client,
    /// separate client without a request timeout, used for long polls
    watch_client: reqwest::Client,
}

impl EtcdKv {
    /// Creates a client for the etcd member at `endpoint` (e.g.,
    /// "http://127.0.0.1:2379").
    pub fn new(
        log: &Logger,
        endpoint: &str,
        request_timeout: Duration,
    ) -> Result<EtcdKv, Error> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        url::Url::parse(&endpoint).map_err(|e| {
            Error::Protocol(format!("bad endpoint {:?}: {}", endpoint, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| Error::Request { url: endpoint.clone(), err })?;
        let watch_client = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::Request { url: endpoint.clone(), err })?;
        Ok(EtcdKv {
            log: log.new(o!(
                "component" => "EtcdKv",
                "endpoint" => endpoint.clone(),
            )),
            endpoint,
            client,
            watch_client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    async fn send(
        &self,
        key: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<EtcdResponse, Error> {
        let url = self.url(key);
        debug!(self.log, "client request"; "key" => key);
        let response = request
            .send()
            .await
            .map_err(|err| Error::Request { url: url.clone(), err })?;
        parse_response(key, &url, response).await
    }

    async fn put(
        &self,
        key: &str,
        mut form: Vec<(&'static str, String)>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        form.push(("value", value.to_string()));
        if let Some(ttl) = ttl {
            // etcd TTLs are whole seconds; never round down to "no TTL".
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }
        let response = self
            .send(key, self.client.put(self.url(key)).form(&form))
            .await?;
        node_index(key, response.node)
    }
}

async fn parse_response(
    key: &str,
    url: &str,
    response: reqwest::Response,
) -> Result<EtcdResponse, Error> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| Error::Request { url: url.to_string(), err })?;
    decode_response(key, status, &body)
}

fn decode_response(
    key: &str,
    status: reqwest::StatusCode,
    body: &[u8],
) -> Result<EtcdResponse, Error> {
    if status.is_success() {
        serde_json::from_slice(body).map_err(|e| {
            Error::Protocol(format!("parsing response for {}: {}", key, e))
        })
    } else {
        let error: EtcdError = serde_json::from_slice(body).map_err(|e| {
            Error::Protocol(format!(
                "unexpected status {} for {}: {}",
                status, key, e
            ))
        })?;
        Err(error.into_error(key))
    }
}

/// Returns the store-wide index etcd reports with every response.
fn header_index(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn node_index(key: &str, node: Option<EtcdNode>) -> Result<u64, Error> {
    node.map(|n| n.modified_index)
        .ok_or_else(|| Error::Protocol(format!("no node returned for {}", key)))
}

fn to_event(response: EtcdResponse) -> Result<WatchEvent, Error> {
    let node = response.node.ok_or_else(|| {
        Error::Protocol(String::from("watch event without node"))
    })?;
    let key = node.key.ok_or_else(|| {
        Error::Protocol(String::from("watch event without key"))
    })?;
    let kind = match response.action.as_str() {
        "create" => EventKind::Create,
        "set" if response.prev_node.is_none() => EventKind::Create,
        "set" | "update" | "compareAndSwap" => EventKind::Update,
        "delete" | "compareAndDelete" | "expire" => EventKind::Delete,
        other => {
            return Err(Error::Protocol(format!(
                "unknown watch action {:?}",
                other
            )))
        }
    };
    let value = match kind {
        EventKind::Delete => None,
        _ => node.value,
    };
    Ok(WatchEvent { key, kind, value, index: node.modified_index })
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn get(&self, key: &str) -> Result<KvValue, Error> {
        let response = self.send(key, self.client.get(self.url(key))).await?;
        let node = response
            .node
            .ok_or_else(|| Error::Protocol(format!("no node for {}", key)))?;
        if node.dir {
            return Err(Error::IsDirectory { key: key.to_string() });
        }
        Ok(KvValue {
            key: key.to_string(),
            value: node.value.unwrap_or_default(),
            index: node.modified_index,
        })
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        self.put(key, Vec::new(), value, ttl).await
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        self.put(key, vec![("prevExist", String::from("false"))], value, ttl)
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<u64, Error> {
        self.put(key, vec![("prevIndex", prev_index.to_string())], value, ttl)
            .await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error> {
        let mut request = self.client.delete(self.url(key));
        if recursive {
            request = request.query(&[("recursive", "true")]);
        }
        self.send(key, request).await.map(|_| ())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        prev_index: u64,
    ) -> Result<(), Error> {
        let request = self
            .client
            .delete(self.url(key))
            .query(&[("prevIndex", prev_index.to_string())]);
        self.send(key, request).await.map(|_| ())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, Error> {
        let prefix = normalize_prefix(prefix);
        let response =
            self.send(prefix, self.client.get(self.url(prefix))).await?;
        let node = response
            .node
            .ok_or_else(|| Error::Protocol(format!("no node for {}", prefix)))?;
        if !node.dir {
            return Err(Error::Protocol(format!(
                "{} is not a directory",
                prefix
            )));
        }
        let mut nodes: Vec<KvNode> = node
            .nodes
            .into_iter()
            .filter_map(|n| {
                Some(KvNode {
                    key: n.key?,
                    value: if n.dir { None } else { n.value },
                    dir: n.dir,
                    index: n.modified_index,
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn head_index(&self) -> Result<u64, Error> {
        let url = self.url("/");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::Request { url: url.clone(), err })?;
        let index = header_index(&response);
        parse_response("/", &url, response).await?;
        index.ok_or_else(|| {
            Error::Protocol(format!("no {} header from {}", INDEX_HEADER, url))
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<WatchStream, Error> {
        let prefix = normalize_prefix(prefix).to_string();
        // The first poll may go out much later than this call, so pin its
        // start now.
        let after_index = match after_index {
            0 => self.head_index().await?,
            index => index,
        };
        debug!(self.log, "watching"; "prefix" => &prefix,
            "after_index" => after_index);

        let stream = futures::stream::unfold(
            Some((self.clone(), prefix, after_index + 1)),
            |state| async move {
                let (client, prefix, wait_index) = state?;
                loop {
                    match client.poll(&prefix, wait_index).await {
                        Ok(None) => continue,
                        Ok(Some(event)) => {
                            let next = event.index + 1;
                            return Some((
                                Ok(event),
                                Some((client, prefix, next)),
                            ));
                        }
                        Err(error) => return Some((Err(error), None)),
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

impl EtcdKv {
    /// Waits for the first change under `prefix` at or after `wait_index`.
    /// Returns `None` if the poll ended without one.
    async fn poll(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> Result<Option<WatchEvent>, Error> {
        let url = self.url(prefix);
        let query = [
            ("wait", String::from("true")),
            ("recursive", String::from("true")),
            ("waitIndex", wait_index.to_string()),
        ];
        let response = self
            .watch_client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|err| Error::Request { url: url.clone(), err })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::Request { url: url.clone(), err })?;

        // etcd, or a proxy in front of it, ends idle polls with an empty body.
        if status.is_success() && body.iter().all(u8::is_ascii_whitespace) {
            debug!(self.log, "long poll ended without a change";
                "prefix" => prefix, "wait_index" => wait_index);
            return Ok(None);
        }
        decode_response(prefix, status, &body).and_then(to_event).map(Some)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use corral_test_utils::dev::test_setup_log;
    use httptest::matchers::{contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::Expectation;
    use serde_json::json;

    fn client(log: &Logger, server: &httptest::Server) -> EtcdKv {
        let endpoint = format!("http://{}", server.addr());
        EtcdKv::new(log, &endpoint, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_and_not_found() {
        let logctx = test_setup_log("test_get_and_not_found");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v2/keys/corral/jobs/j1",
            ))
            .respond_with(json_encoded(json!({
                "action": "get",
                "node": {
                    "key": "/corral/jobs/j1",
                    "value": "{}",
                    "modifiedIndex": 7,
                    "createdIndex": 7
                }
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v2/keys/corral/jobs/j2",
            ))
            .respond_with(status_code(404).body(
                json!({
                    "errorCode": 100,
                    "message": "Key not found",
                    "cause": "/corral/jobs/j2",
                    "index": 9
                })
                .to_string(),
            )),
        );

        let kv = client(&logctx.log, &server);
        let value = kv.get("/corral/jobs/j1").await.unwrap();
        assert_eq!(value.value, "{}");
        assert_eq!(value.index, 7);
        assert_matches!(
            kv.get("/corral/jobs/j2").await,
            Err(Error::NotFound { key }) if key == "/corral/jobs/j2"
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_compare_and_swap_conflict() {
        let logctx = test_setup_log("test_compare_and_swap_conflict");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "PUT",
                "/v2/keys/corral/jobs/j1",
            ))
            .respond_with(status_code(412).body(
                json!({
                    "errorCode": 101,
                    "message": "Compare failed",
                    "cause": "[4 != 5]",
                    "index": 5
                })
                .to_string(),
            )),
        );

        let kv = client(&logctx.log, &server);
        assert_matches!(
            kv.compare_and_swap("/corral/jobs/j1", "{}", None, 4).await,
            Err(Error::Conflict { .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_list() {
        let logctx = test_setup_log("test_list");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v2/keys/corral/hypervisors",
            ))
            .respond_with(json_encoded(json!({
                "action": "get",
                "node": {
                    "key": "/corral/hypervisors",
                    "dir": true,
                    "nodes": [
                        { "key": "/corral/hypervisors/h2", "dir": true,
                          "modifiedIndex": 4 },
                        { "key": "/corral/hypervisors/h1", "dir": true,
                          "modifiedIndex": 3 }
                    ],
                    "modifiedIndex": 2
                }
            }))),
        );

        let kv = client(&logctx.log, &server);
        let nodes = kv.list("/corral/hypervisors/").await.unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["h1", "h2"]);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_watch_from_head() {
        let logctx = test_setup_log("test_watch_from_head");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v2/keys/"))
                .times(2)
                .respond_with(
                    status_code(200)
                        .insert_header(INDEX_HEADER, "41")
                        .body(
                            json!({
                                "action": "get",
                                "node": { "dir": true, "nodes": [] }
                            })
                            .to_string(),
                        ),
                ),
        );
        // The first poll is cut off with an empty body and simply repeated.
        server.expect(
            Expectation::matching(httptest::all_of![
                request::method_path("GET", "/v2/keys/corral/guests"),
                request::query(url_decoded(contains(("waitIndex", "42")))),
            ])
            .times(2)
            .respond_with(httptest::cycle![
                status_code(200),
                json_encoded(json!({
                    "action": "set",
                    "node": {
                        "key": "/corral/guests/g1/metadata",
                        "value": "{}",
                        "modifiedIndex": 42
                    }
                })),
            ]),
        );
        server.expect(
            Expectation::matching(httptest::all_of![
                request::method_path("GET", "/v2/keys/corral/guests"),
                request::query(url_decoded(contains(("waitIndex", "51")))),
            ])
            .respond_with(
                status_code(400).body(
                    json!({
                        "errorCode": 401,
                        "message": "The event in requested index is outdated",
                        "cause": "[60/51]",
                        "index": 70
                    })
                    .to_string(),
                ),
            ),
        );

        let kv = client(&logctx.log, &server);
        assert_eq!(kv.head_index().await.unwrap(), 41);

        let mut stream = kv.watch("/corral/guests/", 0).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.key, "/corral/guests/g1/metadata");
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.index, 42);
        drop(stream);

        // An explicit start skips the head lookup.
        let mut stream = kv.watch("/corral/guests", 50).await.unwrap();
        assert_matches!(
            stream.next().await,
            Some(Err(Error::IndexCleared { index: 70 }))
        );
        assert!(stream.next().await.is_none());
        logctx.cleanup_successful();
    }

    #[test]
    fn test_event_actions() {
        let parse = |action: &str, prev: bool| {
            to_event(EtcdResponse {
                action: action.to_string(),
                node: Some(EtcdNode {
                    key: Some(String::from("/k")),
                    value: Some(String::from("v")),
                    dir: false,
                    nodes: Vec::new(),
                    modified_index: 12,
                }),
                prev_node: prev.then(|| EtcdNode {
                    key: Some(String::from("/k")),
                    value: Some(String::from("old")),
                    dir: false,
                    nodes: Vec::new(),
                    modified_index: 11,
                }),
            })
            .unwrap()
        };

        assert_eq!(parse("set", false).kind, EventKind::Create);
        assert_eq!(parse("set", true).kind, EventKind::Update);
        assert_eq!(parse("compareAndSwap", true).kind, EventKind::Update);
        assert_eq!(parse("create", false).kind, EventKind::Create);
        let expired = parse("expire", true);
        assert_eq!(expired.kind, EventKind::Delete);
        assert_eq!(expired.value, None);
        assert_eq!(expired.index, 12);
    }
}
