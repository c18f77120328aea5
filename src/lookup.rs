//! HTTP client for nsqlookupd: `lookup(topic)`, `ping()`, `nodes()`.

use crate::error::{NsqError, NsqResult};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct LookupProducer {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub http_port: u16,
}

impl LookupProducer {
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<LookupProducer>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    producers: Vec<LookupProducer>,
}

/// A single nsqlookupd HTTP endpoint.
pub struct LookupdClient {
    http: reqwest::Client,
    base_url: String,
}

impl LookupdClient {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> NsqResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(LookupdClient {
            http,
            base_url: base_url.into(),
        })
    }

    /// `GET /lookup?topic=<topic>` — the set of producers currently serving
    /// `topic`. 404 means the topic is unknown to this lookupd, which is not
    /// a discovery error: it simply yields no producers.
    pub async fn lookup(&self, topic: &str) -> NsqResult<Vec<LookupProducer>> {
        let url = format!("{}/lookup", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("topic", topic)])
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        let body: LookupResponse = resp.json().await?;
        Ok(body.producers)
    }

    pub async fn nodes(&self) -> NsqResult<Vec<LookupProducer>> {
        let url = format!("{}/nodes", self.base_url.trim_end_matches('/'));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        let body: NodesResponse = resp.json().await?;
        Ok(body.producers)
    }

    pub async fn ping(&self) -> NsqResult<()> {
        let url = format!("{}/ping", self.base_url.trim_end_matches('/'));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()));
        }
        Ok(())
    }
}

fn classify_status(status: reqwest::StatusCode) -> NsqError {
    if status.is_client_error() {
        NsqError::Discovery(format!("lookupd returned client error {status}"))
    } else {
        NsqError::Discovery(format!("lookupd returned server error {status}, should retry"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_addr_formats_host_and_port() {
        let p = LookupProducer {
            broadcast_address: "nsqd-1".to_string(),
            tcp_port: 4150,
            http_port: 4151,
        };
        assert_eq!(p.tcp_addr(), "nsqd-1:4150");
    }
}
