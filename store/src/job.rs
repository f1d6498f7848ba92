// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted record of one guest-directed operation
//!
//! ```text
//!   new ---> working ---> done
//!    |          |
//!    +----------+-------> error
//! ```
//!
//! `done` and `error` are terminal.  The one exception to "forward only" is
//! the chaining of an image fetch into guest creation: a successful "fetch"
//! job is rewritten in place into a "create" job in state `new`.

use crate::Entity;
use crate::Error;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Well-known job actions.  Any other action is passed through to the
/// hypervisor agent as a guest action.
pub mod actions {
    pub const SELECT_HYPERVISOR: &str = "select-hypervisor";
    pub const FETCH: &str = "fetch";
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Working,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::New => "new",
            JobStatus::Working => "working",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub action: String,
    pub guest: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: JobStatus,
    /// the hypervisor agent's ID for the operation in flight
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

impl Job {
    pub fn new(action: &str, guest: Uuid) -> Job {
        Job {
            id: Uuid::new_v4(),
            action: action.to_string(),
            guest,
            error: None,
            status: JobStatus::New,
            remote: String::new(),
            started_at: None,
            finished_at: None,
            version: 0,
        }
    }

    /// Records that the remote operation `remote` is in flight.
    pub fn set_working(&mut self, remote: &str) {
        self.status = JobStatus::Working;
        self.remote = remote.to_string();
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn set_done(&mut self) {
        self.status = JobStatus::Done;
        self.finished_at = Some(Utc::now());
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
    }

    /// Turns a completed "fetch" into the "create" that follows it.
    pub fn chain_to_create(&mut self) {
        self.action = actions::CREATE.to_string();
        self.status = JobStatus::New;
        self.remote = String::new();
    }
}

impl Entity for Job {
    const KIND: &'static str = "jobs";
    type Id = Uuid;

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn key(root: &str, id: &Uuid) -> String {
        format!("{}/{}/{}", root, Self::KIND, id)
    }

    fn dir(root: &str, id: &Uuid) -> String {
        Self::key(root, id)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.action.is_empty() {
            return Err(self.invalid("action is empty"));
        }
        match (self.status, &self.error) {
            (JobStatus::Error, None) => {
                Err(self.invalid("failed job has no error message"))
            }
            (JobStatus::Error, Some(_)) | (_, None) => Ok(()),
            (status, Some(_)) => Err(self.invalid(format!(
                "job in state {} carries an error message",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_job_json() {
        let job = Job::new(actions::SELECT_HYPERVISOR, Uuid::new_v4());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "new");
        assert_eq!(json["action"], "select-hypervisor");
        assert!(json.get("error").is_none());
        assert!(json.get("remote").is_none());
        assert!(json.get("started_at").is_none());

        let mut job = job;
        job.set_working("abc");
        job.set_error("agent failed");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["remote"], "abc");
        assert_eq!(json["error"], "agent failed");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_chain_to_create() {
        let mut job = Job::new(actions::FETCH, Uuid::new_v4());
        job.set_working("abc");
        let started = job.started_at;
        job.chain_to_create();
        assert_eq!(job.action, actions::CREATE);
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.remote, "");
        assert_eq!(job.started_at, started);

        // Starting the create keeps the original start time.
        job.set_working("def");
        assert_eq!(job.started_at, started);
    }

    #[test]
    fn test_validate() {
        let mut job = Job::new("reboot", Uuid::new_v4());
        job.validate().unwrap();
        job.error = Some(String::from("oops"));
        assert_matches!(job.validate(), Err(Error::Invalid { .. }));
        job.set_error("oops");
        job.validate().unwrap();
        job.error = None;
        assert_matches!(job.validate(), Err(Error::Invalid { .. }));
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Working.is_terminal());
    }
}
