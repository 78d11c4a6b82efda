use crate::dns::{self, Codec, Forwarder, Message, ResourceRecord};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::codec::Encoder;
use tokio_util::udp::UdpFramed;

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// How answers are produced for an inbound query.
#[derive(Clone)]
pub enum Handler {
    /// Answers every question locally with the same address record.
    Standalone { ttl: i32, addr: Ipv4Addr },
    /// Relays every question to an upstream resolver.
    Forwarding(Forwarder),
}

impl Handler {
    pub async fn handle(&self, query: &Message) -> Message {
        match self {
            Handler::Standalone { ttl, addr } => {
                let answers = query
                    .questions
                    .iter()
                    .map(|q| ResourceRecord::address(q.name.clone(), q.query_class, *ttl, *addr))
                    .collect();

                Message::response(query, answers)
            }
            Handler::Forwarding(forwarder) => forwarder.forward(query).await,
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Handler::Standalone { .. } => "standalone",
            Handler::Forwarding(_) => "forwarding",
        }
    }
}

pub struct Server {
    socket: UdpSocket,
    handler: Arc<Handler>,
    max_in_flight: usize,
}

impl Server {
    pub async fn bind(listen_addr: SocketAddr, handler: Handler, max_in_flight: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket,
            handler: Arc::new(handler),
            max_in_flight: max_in_flight.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves queries until `shutdown` resolves.
    ///
    /// Each decoded query is handled in its own task; at most
    /// `max_in_flight` of them run at once. Datagrams that fail to decode
    /// are logged and dropped.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let socket = Arc::new(self.socket);
        let gate = Arc::new(Semaphore::new(self.max_in_flight));
        let mut datagrams = UdpFramed::new(Arc::clone(&socket), Codec);

        log::info!(
            "DNS server now listening on: {} ({} mode)",
            socket.local_addr()?,
            self.handler.mode()
        );

        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                _ = &mut shutdown => break,
                next = datagrams.next() => next,
            };

            let (query, peer) = match next {
                Some(Ok(datagram)) => datagram,
                Some(Err(err)) => {
                    log::warn!("Dropping inbound datagram: {}", err);
                    continue;
                }
                None => break,
            };
            log::debug!("Query from {}: {:?}", peer, query);

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let socket = Arc::clone(&socket);
            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                let response = handler.handle(&query).await;
                log::debug!("Response to {}: {:?}", peer, response);

                if let Err(err) = reply(&socket, response, peer).await {
                    log::error!("Failed to send response to {}: {}", peer, err);
                }

                drop(permit);
            });
        }

        log::info!("DNS server shutting down");
        Ok(())
    }
}

async fn reply(socket: &UdpSocket, response: Message, peer: SocketAddr) -> Result<(), dns::Error> {
    let mut buf = BytesMut::new();
    Codec.encode(response, &mut buf)?;
    socket.send_to(&buf, peer).await?;

    Ok(())
}
