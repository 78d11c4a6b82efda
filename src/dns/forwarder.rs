use crate::{
    dns::{Error, Header, Message, Question, ResourceRecord, MAX_DATAGRAM_LEN},
    parser,
};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One request/reply exchange with an upstream resolver.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends `query` and returns the single reply datagram.
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Plain DNS over UDP, a fresh socket per exchange.
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    server_addr: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(server_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            server_addr,
            timeout,
        }
    }
}

fn unavailable(server_addr: SocketAddr, what: impl std::fmt::Display) -> Error {
    Error::UpstreamUnavailable(format!("{}: {}", server_addr, what))
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| unavailable(self.server_addr, e))?;
        // only accept datagrams coming from the resolver
        socket
            .connect(self.server_addr)
            .await
            .map_err(|e| unavailable(self.server_addr, e))?;

        tokio::time::timeout(self.timeout, socket.send(query))
            .await
            .map_err(|_| unavailable(self.server_addr, "timeout sending query"))?
            .map_err(|e| unavailable(self.server_addr, e))?;

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| unavailable(self.server_addr, "timeout waiting for reply"))?
            .map_err(|e| unavailable(self.server_addr, e))?;

        buf.truncate(len);
        Ok(buf)
    }
}

/// Splits a query into one upstream query per question and merges the
/// answers back into a single response.
#[derive(Clone)]
pub struct Forwarder {
    upstream: Arc<dyn Upstream>,
    retries: u32,
    backoff: Duration,
}

impl Forwarder {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            retries: 0,
            backoff: Duration::from_millis(100),
        }
    }

    /// Retries exchanges failing with `UpstreamUnavailable` up to `retries`
    /// times, doubling `backoff` after every attempt.
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Resolves every question of `query` in order, one exchange at a time.
    ///
    /// A question whose exchange fails contributes no answers; the response
    /// is built from whatever the others returned.
    pub async fn forward(&self, query: &Message) -> Message {
        let mut answers = Vec::new();

        for question in &query.questions {
            match self.resolve(&query.header, question).await {
                Ok(mut records) => answers.append(&mut records),
                Err(err) => log::warn!(
                    "Skipping question {} ({:?}) of query {}: {}",
                    question.name,
                    question.query_type,
                    query.header.id,
                    err
                ),
            }
        }

        Message::response(query, answers)
    }

    async fn resolve(&self, header: &Header, question: &Question) -> Result<Vec<ResourceRecord>, Error> {
        let sub_query = Message::sub_query(header, question.clone());
        log::debug!("Forwarding sub-query: {:?}", sub_query);

        let raw_reply = self.exchange(&Vec::<u8>::from(&sub_query)).await?;
        let reply = parser::message(&raw_reply)
            .map_err(|e| Error::UpstreamMalformedResponse(e.to_string()))?;
        log::debug!("Upstream reply: {:?}", reply);

        if reply.header.id != sub_query.header.id {
            return Err(Error::UpstreamMalformedResponse(format!(
                "reply id {} does not match query id {}",
                reply.header.id, sub_query.header.id
            )));
        }

        Ok(reply.answers)
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, Error> {
        let mut attempt = 0;
        let mut backoff = self.backoff;

        loop {
            match self.upstream.exchange(query).await {
                Err(Error::UpstreamUnavailable(reason)) if attempt < self.retries => {
                    attempt += 1;
                    log::debug!(
                        "Upstream unavailable ({}), retry {}/{} in {:?}",
                        reason,
                        attempt,
                        self.retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }
}
