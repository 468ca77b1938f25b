//! Redis over RESP on a plain TCP socket
//!
//! One connection is kept behind a mutex and re-established after any I/O
//! failure. `INFO server` is read once to choose between `UNLINK` and `DEL`.

use super::resp::{encode_command, RespValue};
use super::CacheStore;
use crate::error::{ProjectionError, ProjectionResult};
use async_trait::async_trait;
use bytes::BytesMut;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use url::Url;

const SCAN_COUNT: &str = "200";
const DELETE_BATCH: usize = 500;

/// Key removal command supported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCommand {
    /// Non-blocking delete, Redis 4.0 and later
    Unlink,
    Del,
}

impl DeleteCommand {
    /// Pick from an `INFO server` payload
    pub fn from_info(info: &str) -> Self {
        let major = info
            .lines()
            .find_map(|l| l.strip_prefix("redis_version:"))
            .and_then(|v| v.trim().split('.').next())
            .and_then(|m| m.parse::<u32>().ok())
            .unwrap_or(0);
        if major >= 4 {
            DeleteCommand::Unlink
        } else {
            DeleteCommand::Del
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DeleteCommand::Unlink => "UNLINK",
            DeleteCommand::Del => "DEL",
        }
    }
}

/// Map an error reply: server-state errors take the target down, the rest
/// reject the single command
pub fn classify_reply(message: &str) -> ProjectionError {
    const UNAVAILABLE: [&str; 5] = ["NOAUTH", "WRONGPASS", "LOADING", "MASTERDOWN", "READONLY"];
    if UNAVAILABLE.iter().any(|p| message.starts_with(p)) {
        ProjectionError::TargetUnavailable(message.to_string())
    } else {
        ProjectionError::WriteRejected(message.to_string())
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn send(&mut self, args: &[&str]) -> ProjectionResult<RespValue> {
        let io = |e: std::io::Error| ProjectionError::TargetUnavailable(e.to_string());
        self.stream.write_all(&encode_command(args)).await.map_err(io)?;

        loop {
            if let Some(frame) = RespValue::decode(&mut self.buf)
                .map_err(|e| ProjectionError::TargetUnavailable(e.to_string()))?
            {
                return match frame {
                    RespValue::Error(message) => Err(classify_reply(&message)),
                    other => Ok(other),
                };
            }
            if self.stream.read_buf(&mut self.buf).await.map_err(io)? == 0 {
                return Err(ProjectionError::TargetUnavailable(
                    "connection closed by server".to_string(),
                ));
            }
        }
    }
}

/// Cache backed by a Redis server
/// Decoded `AUTH` arguments from the URL userinfo: optional user, then password
fn credentials(url: &Url) -> ProjectionResult<Option<(Option<String>, String)>> {
    let Some(password) = url.password() else {
        return Ok(None);
    };
    let decode = |raw: &str| {
        percent_decode_str(raw)
            .decode_utf8()
            .map(|text| text.into_owned())
            .map_err(|e| ProjectionError::TargetUnavailable(format!("cache credentials are not UTF-8: {}", e)))
    };
    let user = match url.username() {
        "" => None,
        raw => Some(decode(raw)?),
    };
    Ok(Some((user, decode(password)?)))
}

pub struct RedisCache {
    url: Url,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
    delete: OnceCell<DeleteCommand>,
}

impl RedisCache {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            connection: Mutex::new(None),
            delete: OnceCell::new(),
        }
    }

    async fn connect(&self) -> ProjectionResult<Connection> {
        let host = self.url.host_str().unwrap_or("localhost");
        let port = self.url.port().unwrap_or(6379);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProjectionError::TargetUnavailable(format!("{}:{}: {}", host, port, e)))?;

        let mut connection = Connection {
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        if let Some((user, password)) = credentials(&self.url)? {
            match user {
                Some(user) => connection.send(&["AUTH", user.as_str(), password.as_str()]).await?,
                None => connection.send(&["AUTH", password.as_str()]).await?,
            };
        }

        let db = self.url.path().trim_start_matches('/');
        if !db.is_empty() {
            connection.send(&["SELECT", db]).await?;
        }

        debug!(host, port, "Opened Redis connection");
        Ok(connection)
    }

    /// Send one command, bounded by the configured timeout
    async fn call(&self, args: &[&str]) -> ProjectionResult<RespValue> {
        let mut guard = self.connection.lock().await;

        let attempt = async {
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }
            match guard.as_mut() {
                Some(connection) => connection.send(args).await,
                None => Err(ProjectionError::TargetUnavailable("no connection".to_string())),
            }
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProjectionError::TargetUnavailable(format!(
                "{} timed out after {:?}",
                args.first().copied().unwrap_or_default(),
                self.timeout
            ))),
        };

        // Drop the socket on anything but a clean reply or a rejected command
        if matches!(result, Err(ProjectionError::TargetUnavailable(_))) {
            *guard = None;
        }
        result
    }

    async fn delete_command(&self) -> ProjectionResult<DeleteCommand> {
        self.delete
            .get_or_try_init(|| async {
                let info = self
                    .call(&["INFO", "server"])
                    .await?
                    .as_text()
                    .unwrap_or_default();
                let command = DeleteCommand::from_info(&info);
                info!(command = command.as_str(), "Connected to Redis");
                Ok::<_, ProjectionError>(command)
            })
            .await
            .copied()
    }
}

fn unexpected(command: &str, reply: &RespValue) -> ProjectionError {
    ProjectionError::TargetUnavailable(format!("unexpected {} reply: {:?}", command, reply))
}

#[async_trait]
impl CacheStore for RedisCache {
    fn describe(&self) -> String {
        match self.delete.get() {
            Some(d) => format!("redis ({}) at {}", d.as_str(), self.url),
            None => format!("redis at {}", self.url),
        }
    }

    async fn ping(&self) -> ProjectionResult<()> {
        self.call(&["PING"]).await?;
        self.delete_command().await.map(|_| ())
    }

    async fn set_json(&self, key: &str, value: &Value) -> ProjectionResult<()> {
        self.call(&["SET", key, &value.to_string()]).await.map(|_| ())
    }

    async fn get_json(&self, key: &str) -> ProjectionResult<Option<Value>> {
        match self.call(&["GET", key]).await? {
            RespValue::Bulk(None) => Ok(None),
            reply => {
                let raw = reply.as_text().ok_or_else(|| unexpected("GET", &reply))?;
                serde_json::from_str(&raw).map(Some).map_err(|e| {
                    ProjectionError::TargetUnavailable(format!("key '{}' is not JSON: {}", key, e))
                })
            }
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> ProjectionResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["SADD", key];
        args.extend(members.iter().map(String::as_str));
        let reply = self.call(&args).await?;
        reply
            .as_integer()
            .map(|n| n as u64)
            .ok_or_else(|| unexpected("SADD", &reply))
    }

    async fn set_members(&self, key: &str) -> ProjectionResult<Vec<String>> {
        let reply = self.call(&["SMEMBERS", key]).await?;
        let mut members: Vec<String> = reply
            .clone()
            .into_array()
            .ok_or_else(|| unexpected("SMEMBERS", &reply))?
            .iter()
            .filter_map(RespValue::as_text)
            .collect();
        members.sort();
        Ok(members)
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> ProjectionResult<()> {
        self.call(&["ZADD", key, &score.to_string(), member])
            .await
            .map(|_| ())
    }

    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> ProjectionResult<Vec<(String, f64)>> {
        let reply = self
            .call(&["ZRANGEBYSCORE", key, &min.to_string(), &max.to_string(), "WITHSCORES"])
            .await?;
        let items = reply
            .clone()
            .into_array()
            .ok_or_else(|| unexpected("ZRANGEBYSCORE", &reply))?;

        items
            .chunks(2)
            .map(|pair| {
                let member = pair.first().and_then(RespValue::as_text);
                let score = pair
                    .get(1)
                    .and_then(RespValue::as_text)
                    .and_then(|s| s.parse::<f64>().ok());
                match (member, score) {
                    (Some(m), Some(s)) => Ok((m, s)),
                    _ => Err(unexpected("ZRANGEBYSCORE", &reply)),
                }
            })
            .collect()
    }

    async fn scan(&self, pattern: &str) -> ProjectionResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        let mut cursor = "0".to_string();

        loop {
            let reply = self
                .call(&["SCAN", &cursor, "MATCH", pattern, "COUNT", SCAN_COUNT])
                .await?;
            let mut parts = reply
                .clone()
                .into_array()
                .ok_or_else(|| unexpected("SCAN", &reply))?
                .into_iter();

            cursor = parts
                .next()
                .and_then(|c| c.as_text())
                .ok_or_else(|| unexpected("SCAN", &reply))?;
            if let Some(batch) = parts.next().and_then(RespValue::into_array) {
                keys.extend(batch.iter().filter_map(RespValue::as_text));
            }

            if cursor == "0" {
                break;
            }
        }

        Ok(keys.into_iter().collect())
    }

    async fn delete(&self, keys: &[String]) -> ProjectionResult<u64> {
        let command = self.delete_command().await?;
        let mut removed = 0;

        for chunk in keys.chunks(DELETE_BATCH) {
            let mut args = vec![command.as_str()];
            args.extend(chunk.iter().map(String::as_str));
            let reply = self.call(&args).await?;
            match reply.as_integer() {
                Some(n) => removed += n as u64,
                None => warn!(command = command.as_str(), "Delete returned {:?}", reply),
            }
        }

        Ok(removed)
    }

    async fn exists(&self, key: &str) -> ProjectionResult<bool> {
        let reply = self.call(&["EXISTS", key]).await?;
        reply
            .as_integer()
            .map(|n| n > 0)
            .ok_or_else(|| unexpected("EXISTS", &reply))
    }
}
