// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the agent running on each hypervisor
//!
//! Every operation the agent performs on a guest is asynchronous: the
//! request is answered with 202 Accepted and the agent's own job ID in the
//! [`JOB_ID_HEADER`] header, and the caller polls
//! `GET /guests/{id}/jobs/{job}` until that job completes or fails.

use async_trait::async_trait;
use corral_store::Guest;
use corral_store::Hypervisor;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, o, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Response header carrying the agent's job ID
pub const JOB_ID_HEADER: &str = "X-Guest-Job-ID";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The agent could not be reached.
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The agent answered, but is temporarily unable to serve the request.
    #[error("agent at {url} unavailable ({status})")]
    Unavailable { url: String, status: u16 },

    /// The agent refused the request.
    #[error("agent at {url} rejected request ({status}): {message}")]
    Rejected { url: String, status: u16, message: String },

    #[error("agent response from {url} had no job ID header")]
    MissingJobId { url: String },

    #[error("bad response from {url}: {message}")]
    Protocol { url: String, message: String },
}

impl Error {
    /// Returns true if the same request may well succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Unavailable { .. })
    }
}

/// State of a job on the agent
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobStatus {
    #[serde(alias = "running")]
    Pending,
    #[serde(alias = "done")]
    Complete,
    #[serde(alias = "error", alias = "failed")]
    Errored,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteJob {
    pub status: RemoteJobStatus,
    /// failure detail, if the agent gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Operations on guests offered by a hypervisor agent
///
/// All but [`GuestAgent::job_status()`] start an agent job and return its ID.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    async fn fetch_image(&self, guest: &Guest) -> Result<String, Error>;
    async fn create_guest(&self, guest: &Guest) -> Result<String, Error>;
    async fn delete_guest(&self, guest: &Guest) -> Result<String, Error>;
    async fn guest_action(
        &self,
        guest: &Guest,
        action: &str,
    ) -> Result<String, Error>;
    async fn job_status(
        &self,
        guest: &Guest,
        job: &str,
    ) -> Result<RemoteJob, Error>;
}

/// Finds the agent responsible for a hypervisor
pub trait AgentResolver: Send + Sync {
    fn agent_for(
        &self,
        hypervisor: &Hypervisor,
    ) -> Result<Arc<dyn GuestAgent>, Error>;
}

/// HTTP client for one agent
pub struct Client {
    log: Logger,
    base_url: String,
    client: reqwest::Client,
}

impl Client {
    pub fn new(
        log: &Logger,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Client, Error> {
        Ok(Client::new_with_client(log, base_url, http_client(timeout)?))
    }

    pub fn new_with_client(
        log: &Logger,
        base_url: &str,
        client: reqwest::Client,
    ) -> Client {
        let base_url = base_url.trim_end_matches('/').to_string();
        Client {
            log: log.new(o!(
                "component" => "AgentClient",
                "url" => base_url.clone(),
            )),
            base_url,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        let response = request
            .send()
            .await
            .map_err(|source| Error::Transport { url: url.clone(), source })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if matches!(status.as_u16(), 502..=504) {
            return Err(Error::Unavailable { url, status: status.as_u16() });
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::Rejected { url, status: status.as_u16(), message })
    }

    /// Issues a request that starts an agent job and returns the job ID.
    async fn start(
        &self,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<String, Error> {
        let response = self.send(url.clone(), request).await?;
        let job = response
            .headers()
            .get(JOB_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::MissingJobId { url: url.clone() })?;
        debug!(self.log, "started agent job"; "url" => url, "remote" => &job);
        Ok(job)
    }
}

#[async_trait]
impl GuestAgent for Client {
    async fn fetch_image(&self, guest: &Guest) -> Result<String, Error> {
        let url = format!("{}/guests/{}/fetch", self.base_url, guest.id);
        self.start(url.clone(), self.client.post(&url).json(guest)).await
    }

    async fn create_guest(&self, guest: &Guest) -> Result<String, Error> {
        let url = format!("{}/guests", self.base_url);
        self.start(url.clone(), self.client.post(&url).json(guest)).await
    }

    async fn delete_guest(&self, guest: &Guest) -> Result<String, Error> {
        let url = format!("{}/guests/{}", self.base_url, guest.id);
        self.start(url.clone(), self.client.delete(&url)).await
    }

    async fn guest_action(
        &self,
        guest: &Guest,
        action: &str,
    ) -> Result<String, Error> {
        let url = format!("{}/guests/{}/{}", self.base_url, guest.id, action);
        self.start(url.clone(), self.client.post(&url)).await
    }

    async fn job_status(
        &self,
        guest: &Guest,
        job: &str,
    ) -> Result<RemoteJob, Error> {
        let url =
            format!("{}/guests/{}/jobs/{}", self.base_url, guest.id, job);
        let response = self.send(url.clone(), self.client.get(&url)).await?;
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Transport { url: url.clone(), source })?;
        serde_json::from_slice(&body).map_err(|e| Error::Protocol {
            url,
            message: format!("parsing job status: {}", e),
        })
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|source| Error::Transport {
            url: String::from("(client setup)"),
            source,
        })
}

/// Resolves agents by hypervisor IP address and a fixed port
pub struct HttpAgentResolver {
    log: Logger,
    port: u16,
    client: reqwest::Client,
}

impl HttpAgentResolver {
    pub fn new(
        log: &Logger,
        port: u16,
        timeout: Duration,
    ) -> Result<HttpAgentResolver, Error> {
        let client = http_client(timeout)?;
        Ok(HttpAgentResolver { log: log.clone(), port, client })
    }
}

impl AgentResolver for HttpAgentResolver {
    fn agent_for(
        &self,
        hypervisor: &Hypervisor,
    ) -> Result<Arc<dyn GuestAgent>, Error> {
        let url = format!("http://{}:{}", hypervisor.ip, self.port);
        let client =
            Client::new_with_client(&self.log, &url, self.client.clone());
        Ok(Arc::new(client))
    }
}
