// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! beanstalkd client
//!
//! Speaks the beanstalkd text protocol over a single TCP connection.  The
//! connection remembers which tube it `use`s for puts and which tubes it
//! `watch`es for reserves, so both are switched lazily as callers move
//! between tubes.  After an I/O error, or when a command is cancelled before
//! its reply was read, the connection is dropped and the next command
//! reconnects.

use crate::broker::Broker;
use crate::broker::BrokerError;
use crate::broker::Message;
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;

const DEFAULT_TUBE: &str = "default";

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    using: String,
    watching: BTreeSet<String>,
}

impl Connection {
    async fn connect(address: &str) -> Result<Connection, BrokerError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
            using: DEFAULT_TUBE.to_string(),
            watching: BTreeSet::from([DEFAULT_TUBE.to_string()]),
        })
    }

    async fn send(&mut self, command: &str) -> Result<(), BrokerError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, BrokerError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the connection",
            )));
        }
        Ok(line.trim_end_matches("\r\n").to_string())
    }

    async fn command(&mut self, command: &str) -> Result<String, BrokerError> {
        self.send(command).await?;
        self.read_line().await
    }

    /// Reads a `<bytes>`-long body followed by CRLF.
    async fn read_body(&mut self, len: usize) -> Result<String, BrokerError> {
        let mut body = vec![0u8; len + 2];
        self.reader.read_exact(&mut body).await?;
        if !body.ends_with(b"\r\n") {
            return Err(BrokerError::Protocol(String::from(
                "message body not terminated by CRLF",
            )));
        }
        body.truncate(len);
        String::from_utf8(body).map_err(|_| {
            BrokerError::Protocol(String::from("message body is not UTF-8"))
        })
    }

    async fn use_tube(&mut self, tube: &str) -> Result<(), BrokerError> {
        if self.using == tube {
            return Ok(());
        }
        let reply = self.command(&format!("use {}", tube)).await?;
        if reply != format!("USING {}", tube) {
            return Err(unexpected(reply));
        }
        self.using = tube.to_string();
        Ok(())
    }

    /// Makes `tube` the only watched tube.
    async fn watch_only(&mut self, tube: &str) -> Result<(), BrokerError> {
        if self.watching.len() == 1 && self.watching.contains(tube) {
            return Ok(());
        }
        if !self.watching.contains(tube) {
            let reply = self.command(&format!("watch {}", tube)).await?;
            if !reply.starts_with("WATCHING ") {
                return Err(unexpected(reply));
            }
            self.watching.insert(tube.to_string());
        }
        let others: Vec<String> =
            self.watching.iter().filter(|t| *t != tube).cloned().collect();
        for other in others {
            let reply = self.command(&format!("ignore {}", other)).await?;
            if !reply.starts_with("WATCHING ") {
                return Err(unexpected(reply));
            }
            self.watching.remove(&other);
        }
        Ok(())
    }

    async fn put(
        &mut self,
        tube: &str,
        body: &str,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64, BrokerError> {
        self.use_tube(tube).await?;
        let reply = self
            .command(&format!(
                "put {} {} {} {}\r\n{}",
                priority,
                delay.as_secs(),
                ttr.as_secs().max(1),
                body.len(),
                body
            ))
            .await?;
        if let Some(id) = parse_id(&reply, "INSERTED") {
            Ok(id)
        } else if reply.starts_with("BURIED") {
            Err(BrokerError::Server(reply))
        } else {
            Err(unexpected(reply))
        }
    }

    async fn reserve(
        &mut self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        self.watch_only(tube).await?;
        let reply = self
            .command(&format!("reserve-with-timeout {}", timeout.as_secs()))
            .await?;
        match reply.as_str() {
            "TIMED_OUT" => return Err(BrokerError::TimedOut),
            "DEADLINE_SOON" => return Err(BrokerError::DeadlineSoon),
            _ => (),
        }
        let mut words = reply.split(' ');
        let (Some("RESERVED"), Some(id), Some(len), None) =
            (words.next(), words.next(), words.next(), words.next())
        else {
            return Err(unexpected(reply));
        };
        let (Ok(id), Ok(len)) = (id.parse(), len.parse()) else {
            return Err(unexpected(reply));
        };
        let body = self.read_body(len).await?;
        Ok(Message { id, body })
    }

    async fn delete(&mut self, id: u64) -> Result<(), BrokerError> {
        let reply = self.command(&format!("delete {}", id)).await?;
        match reply.as_str() {
            "DELETED" => Ok(()),
            "NOT_FOUND" => Err(BrokerError::NotFound { id }),
            _ => Err(unexpected(reply)),
        }
    }

    async fn release(
        &mut self,
        id: u64,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let reply = self
            .command(&format!(
                "release {} {} {}",
                id,
                priority,
                delay.as_secs()
            ))
            .await?;
        match reply.as_str() {
            "RELEASED" => Ok(()),
            "BURIED" => Err(BrokerError::Server(reply)),
            "NOT_FOUND" => Err(BrokerError::NotFound { id }),
            _ => Err(unexpected(reply)),
        }
    }
}

/// Maps error replies shared by all commands, or reports anything else as a
/// protocol error.
fn unexpected(reply: String) -> BrokerError {
    match reply.as_str() {
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT"
        | "UNKNOWN_COMMAND" | "DRAINING" | "JOB_TOO_BIG" | "EXPECTED_CRLF" => {
            BrokerError::Server(reply)
        }
        _ => BrokerError::Protocol(reply),
    }
}

fn parse_id(reply: &str, word: &str) -> Option<u64> {
    reply.strip_prefix(word)?.strip_prefix(' ')?.parse().ok()
}

/// Client for one beanstalkd server
pub struct Beanstalk {
    log: Logger,
    address: String,
    conn: Mutex<Option<Connection>>,
}

impl Beanstalk {
    /// Connects to the beanstalkd at `address` ("host:port").
    pub async fn connect(
        log: &Logger,
        address: &str,
    ) -> Result<Beanstalk, BrokerError> {
        let log = log.new(o!(
            "component" => "Beanstalk",
            "address" => address.to_string(),
        ));
        let conn = Connection::connect(address).await?;
        info!(log, "connected to broker");
        Ok(Beanstalk {
            log,
            address: address.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Returns the locked connection, reconnecting if the last one was
    /// dropped.  Commands take the connection out of the slot while they
    /// run, so one that is cancelled halfway leaves the slot empty.
    async fn connection(
        &self,
    ) -> Result<MutexGuard<'_, Option<Connection>>, BrokerError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!(self.log, "reconnecting to broker");
            *guard = Some(Connection::connect(&self.address).await?);
        }
        Ok(guard)
    }

    /// Puts `conn` back unless `result` is an I/O or protocol error, since
    /// its state is then unknown.
    fn settle<T>(
        &self,
        slot: &mut Option<Connection>,
        conn: Connection,
        result: Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        match &result {
            Err(error @ (BrokerError::Io(_) | BrokerError::Protocol(_))) => {
                warn!(self.log, "dropping broker connection";
                    "error" => %error);
            }
            _ => *slot = Some(conn),
        }
        result
    }
}

fn not_connected() -> BrokerError {
    BrokerError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "no broker connection",
    ))
}

#[async_trait]
impl Broker for Beanstalk {
    async fn put(
        &self,
        tube: &str,
        body: &str,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64, BrokerError> {
        let mut guard = self.connection().await?;
        let mut conn = guard.take().ok_or_else(not_connected)?;
        let result = conn.put(tube, body, priority, delay, ttr).await;
        self.settle(&mut guard, conn, result)
    }

    async fn reserve(
        &self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        let mut guard = self.connection().await?;
        let mut conn = guard.take().ok_or_else(not_connected)?;
        let result = conn.reserve(tube, timeout).await;
        self.settle(&mut guard, conn, result)
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        let mut guard = self.connection().await?;
        let mut conn = guard.take().ok_or_else(not_connected)?;
        let result = conn.delete(id).await;
        self.settle(&mut guard, conn, result)
    }

    async fn release(
        &self,
        id: u64,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut guard = self.connection().await?;
        let mut conn = guard.take().ok_or_else(not_connected)?;
        let result = conn.release(id, priority, delay).await;
        self.settle(&mut guard, conn, result)
    }
}
