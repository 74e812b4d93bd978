//! Readiness probes over a bare TCP socket.
//!
//! A probe speaks just enough HTTP/1.0 to ask for the readiness URL and then looks for two
//! things in whatever comes back: the `200 OK` status line and a `"status":"ok"` marker
//! (compared case-insensitively). Both have to be there.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::{future::FutureExt, select};
use http::uri::{InvalidUri, Uri};
use serde::Deserialize;
use slog_scope::debug;
use smol::{Async, Timer};
use std::convert::TryFrom;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SUCCESS_STATUS: &str = "200 OK";
pub const SUCCESS_MARKER: &str = r#""status":"ok""#;

/// We only care about the status line and a short JSON body.
const MAX_RESPONSE_BYTES: usize = 4096;

/// Where a service answers readiness probes.
#[derive(Deserialize)]
#[serde(try_from = "String")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

#[derive(Error, Debug)]
pub enum InvalidEndpoint {
    #[error("not a valid URL: {0}")]
    Unparseable(#[from] InvalidUri),

    #[error("URL {0:?} has no host")]
    NoHost(String),
}

impl Endpoint {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\n\r\n",
            self.path, self.host
        )
    }
}

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s.parse()?;
        let host = uri
            .host()
            .ok_or_else(|| InvalidEndpoint::NoHost(s.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let path = uri
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();
        Ok(Endpoint {
            host,
            port: uri.port_u16().unwrap_or(80),
            path,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = InvalidEndpoint;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Whether a raw HTTP response says the service is ready.
pub fn is_ready_response(response: &str) -> bool {
    response.contains(SUCCESS_STATUS) && response.to_lowercase().contains(SUCCESS_MARKER)
}

#[async_trait(?Send)]
pub trait Readiness {
    /// Polls `endpoint` every `poll_interval` until it reports ready (`true`) or `timeout`
    /// has passed (`false`). Failed attempts only mean "not ready yet".
    async fn await_ready(&self, endpoint: &Endpoint, timeout: Duration, poll_interval: Duration)
        -> bool;
}

#[derive(Error, Debug, PartialEq)]
#[error("probe attempt timed out")]
pub struct AttemptTimedOut;

#[derive(Debug, Clone, Copy)]
pub struct RawHttpProbe {
    attempt_timeout: Duration,
}

impl RawHttpProbe {
    pub fn new(attempt_timeout: Duration) -> Self {
        RawHttpProbe { attempt_timeout }
    }

    /// Runs one probe attempt, returning the raw response text.
    pub async fn attempt(&self, endpoint: &Endpoint) -> Result<String> {
        select! {
            res = exchange(endpoint).fuse() => res,
            _ = Timer::after(self.attempt_timeout).fuse() => Err(AttemptTimedOut.into()),
        }
    }
}

#[async_trait(?Send)]
impl Readiness for RawHttpProbe {
    async fn await_ready(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.attempt(endpoint).await {
                Ok(response) if is_ready_response(&response) => return true,
                Ok(response) => {
                    debug!("service not ready yet";
                           "endpoint" => %endpoint,
                           "status_line" => response.lines().next().unwrap_or(""));
                }
                Err(e) => debug!("probe attempt failed"; "endpoint" => %endpoint, "error" => %e),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            Timer::after(poll_interval.min(deadline - now)).await;
        }
    }
}

async fn connect(endpoint: &Endpoint) -> Result<Async<TcpStream>> {
    let (host, port) = (endpoint.host().to_string(), endpoint.port());
    let addrs = smol::blocking!((host.as_str(), port).to_socket_addrs())?;
    let mut last_error = None;
    for addr in addrs {
        match Async::<TcpStream>::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => e.into(),
        None => anyhow!("{} did not resolve to any address", endpoint.host()),
    })
}

/// Sends the request and reads until the response looks ready, the server hangs up or
/// `MAX_RESPONSE_BYTES` arrived. Servers that keep the connection open are fine.
async fn exchange(endpoint: &Endpoint) -> Result<String> {
    let mut stream = connect(endpoint).await?;
    stream.write_all(endpoint.request().as_bytes()).await?;
    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    while response.len() < MAX_RESPONSE_BYTES {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read]);
        if is_ready_response(&String::from_utf8_lossy(&response)) {
            break;
        }
    }
    response.truncate(MAX_RESPONSE_BYTES);
    Ok(String::from_utf8_lossy(&response).into_owned())
}
