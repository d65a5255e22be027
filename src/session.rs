//! Per-connection tunnel state machine.
//!
//! Each WebSocket connection owns exactly one `Session`. The session starts
//! awaiting a handshake, parses it from the first binary message, and
//! transitions into one of two relay modes: a TCP byte-pipe to the decoded
//! destination, or a DNS-over-HTTPS relay for UDP/port-53 traffic. A second
//! handshake is unrepresentable: parsing only exists in the awaiting phase.

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dns_relay::{DnsRelay, split_frames};
use crate::protocol::{self, Command, HandshakeHeader};

pub const BUFFER_SIZE: usize = 8192;

/// UDP relaying is restricted to DNS.
const DNS_PORT: u16 = 53;

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;

/// Transition out of the handshake phase.
enum NextPhase {
    TcpRelaying {
        header: HandshakeHeader,
        payload: Bytes,
    },
    UdpRelaying {
        header: HandshakeHeader,
        payload: Bytes,
    },
    Closed,
}

/// How an established relay ended.
enum RelayEnd {
    ClientClosed,
    OutboundClosed,
    OutboundFailed(anyhow::Error),
}

struct Session {
    user_id: Uuid,
    dns: DnsRelay,
    /// Whether the two-byte response prefix has been emitted. Session-level
    /// state: set once, before the first client-bound payload.
    header_sent: bool,
}

/// Entry point for an upgraded WebSocket connection.
pub async fn run(socket: WebSocket, client_addr: SocketAddr, user_id: Uuid, dns: DnsRelay) {
    let session = Session {
        user_id,
        dns,
        header_sent: false,
    };
    if let Err(e) = session.serve(socket, client_addr).await {
        error!(client_addr = %client_addr, error = %e, "Tunnel connection failed");
    }
}

impl Session {
    #[tracing::instrument(skip_all, fields(client_addr = %client_addr))]
    async fn serve(mut self, socket: WebSocket, client_addr: SocketAddr) -> Result<()> {
        let (mut sender, mut receiver) = socket.split();

        match self.await_handshake(&mut sender, &mut receiver).await {
            NextPhase::Closed => Ok(()),
            NextPhase::TcpRelaying { header, payload } => {
                self.relay_tcp(&mut sender, &mut receiver, &header, &payload)
                    .await
            }
            NextPhase::UdpRelaying { header, payload } => {
                self.relay_udp(&mut sender, &mut receiver, &header, &payload)
                    .await
            }
        }
    }

    /// Awaiting-handshake phase: the first binary message must carry a valid
    /// handshake header, or the connection is closed with a policy-violation
    /// code and the parse error as the reason.
    async fn await_handshake(
        &mut self,
        sender: &mut ClientSink,
        receiver: &mut ClientStream,
    ) -> NextPhase {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let header = match protocol::parse_handshake(&data, &self.user_id) {
                        Ok(header) => header,
                        Err(e) => {
                            warn!(error = %e, "Rejecting handshake");
                            Self::close(sender, close_code::POLICY, &e.to_string()).await;
                            return NextPhase::Closed;
                        }
                    };
                    let payload = data.slice(header.payload_offset..);
                    debug!(
                        command = ?header.command,
                        destination = %header.address,
                        port = header.port,
                        payload_bytes = payload.len(),
                        "Handshake accepted"
                    );
                    return match header.command {
                        Command::Tcp => NextPhase::TcpRelaying { header, payload },
                        Command::Udp if header.port == DNS_PORT => {
                            NextPhase::UdpRelaying { header, payload }
                        }
                        Command::Udp => {
                            warn!(port = header.port, "Rejecting UDP relay for non-DNS port");
                            Self::close(
                                sender,
                                close_code::POLICY,
                                &format!(
                                    "UDP relay only supports DNS on port {DNS_PORT}, got port {}",
                                    header.port
                                ),
                            )
                            .await;
                            NextPhase::Closed
                        }
                    };
                }
                Ok(Message::Text(_)) => {
                    warn!("Dropping text message before handshake (binary only)");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed before handshake");
                    return NextPhase::Closed;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error before handshake: {e}");
                    return NextPhase::Closed;
                }
            }
        }
        NextPhase::Closed
    }

    /// TCP relay phase: connect to the destination, write the handshake
    /// payload, then act as a duplex byte pipe. The destination's read side
    /// runs concurrently with the inbound message loop.
    async fn relay_tcp(
        &mut self,
        sender: &mut ClientSink,
        receiver: &mut ClientStream,
        header: &HandshakeHeader,
        first_payload: &[u8],
    ) -> Result<()> {
        let target_addr = header.socket_string();

        debug!(target_addr = %target_addr, "Attempting to connect to destination");
        let tcp_stream = match TcpStream::connect(&target_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(target_addr = %target_addr, error = %e, "Failed to connect to destination");
                Self::close(
                    sender,
                    close_code::ERROR,
                    &format!("failed to connect to {target_addr}: {e}"),
                )
                .await;
                return Ok(());
            }
        };
        info!(target_addr = %target_addr, "Connected to destination");

        let (mut tcp_reader, mut tcp_writer) = tcp_stream.into_split();

        if !first_payload.is_empty() {
            if let Err(e) = tcp_writer.write_all(first_payload).await {
                error!(error = %e, "Failed to write handshake payload to destination");
                Self::close(
                    sender,
                    close_code::ERROR,
                    &format!("destination write failed: {e}"),
                )
                .await;
                return Ok(());
            }
        }

        let client_to_dest = async {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        debug!(bytes = data.len(), "Forwarding data from WebSocket to destination");
                        if let Err(e) = tcp_writer.write_all(&data).await {
                            return RelayEnd::OutboundFailed(
                                anyhow::Error::new(e).context("destination write failed"),
                            );
                        }
                    }
                    Ok(Message::Text(_)) => {
                        warn!("Dropping text message (binary only)");
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket connection closed");
                        return RelayEnd::ClientClosed;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket error: {e}");
                        return RelayEnd::ClientClosed;
                    }
                }
            }
            RelayEnd::ClientClosed
        };

        let dest_to_client = async {
            let mut buffer = [0u8; BUFFER_SIZE];
            loop {
                match tcp_reader.read(&mut buffer).await {
                    Ok(0) => {
                        info!("Destination closed the connection");
                        return RelayEnd::OutboundClosed;
                    }
                    Ok(n) => {
                        let chunk = self.client_chunk(header, &buffer[..n]);
                        debug!(bytes = n, "Forwarding data from destination to WebSocket");
                        if let Err(e) = sender.send(Message::Binary(chunk.into())).await {
                            debug!("Failed to send WebSocket message: {e}");
                            return RelayEnd::ClientClosed;
                        }
                    }
                    Err(e) => {
                        return RelayEnd::OutboundFailed(
                            anyhow::Error::new(e).context("destination read failed"),
                        );
                    }
                }
            }
        };

        let outcome = tokio::select! {
            end = client_to_dest => end,
            end = dest_to_client => end,
        };

        // Dropping the socket halves aborts the outbound connection; no
        // graceful shutdown is attempted.
        match outcome {
            RelayEnd::ClientClosed => {}
            RelayEnd::OutboundClosed => {
                Self::close(sender, close_code::NORMAL, "destination closed").await;
            }
            RelayEnd::OutboundFailed(e) => {
                error!(error = %e, "Relay failed");
                Self::close(sender, close_code::ERROR, &format!("{e:#}")).await;
            }
        }

        info!("Tunnel connection closed");
        Ok(())
    }

    /// UDP relay phase: every inbound chunk is split into length-prefixed
    /// datagram frames, each forwarded to the DNS-over-HTTPS resolver.
    async fn relay_udp(
        &mut self,
        sender: &mut ClientSink,
        receiver: &mut ClientStream,
        header: &HandshakeHeader,
        first_payload: &[u8],
    ) -> Result<()> {
        if self
            .forward_datagrams(sender, header, first_payload)
            .await
            .is_err()
        {
            return Ok(());
        }

        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if self.forward_datagrams(sender, header, &data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(_)) => {
                    warn!("Dropping text message (binary only)");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error: {e}");
                    break;
                }
            }
        }

        info!("Tunnel connection closed");
        Ok(())
    }

    /// Forwards each complete frame in `chunk` as one DNS-over-HTTPS query.
    ///
    /// Query failures drop the offending frame and keep the session alive;
    /// only a failure to write back to the client ends the relay.
    async fn forward_datagrams(
        &mut self,
        sender: &mut ClientSink,
        header: &HandshakeHeader,
        chunk: &[u8],
    ) -> Result<()> {
        let (frames, discarded) = split_frames(chunk);
        if discarded > 0 {
            debug!(bytes = discarded, "Discarding trailing partial datagram frame");
        }

        for frame in frames {
            let reply = match self.dns.query(frame).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "DNS query failed, dropping frame");
                    continue;
                }
            };
            if reply.is_empty() {
                debug!("Empty DNS reply, dropping frame");
                continue;
            }
            if reply.len() > usize::from(u16::MAX) {
                warn!(bytes = reply.len(), "DNS reply too large to frame, dropping");
                continue;
            }

            let message = self.dns_reply_frame(header, &reply);
            debug!(bytes = reply.len(), "Forwarding DNS reply to WebSocket");
            sender
                .send(Message::Binary(message.into()))
                .await
                .context("Failed to send DNS reply via WebSocket")?;
        }

        Ok(())
    }

    /// Frames a destination chunk for the client, prepending the response
    /// prefix exactly once per session.
    fn client_chunk(&mut self, header: &HandshakeHeader, data: &[u8]) -> Vec<u8> {
        if self.header_sent {
            return data.to_vec();
        }
        self.header_sent = true;
        let prefix = protocol::response_prefix(header);
        let mut out = Vec::with_capacity(prefix.len() + data.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(data);
        out
    }

    /// Frames a DNS reply as `u16` big-endian length + bytes, with the
    /// response prefix ahead of the first reply only.
    fn dns_reply_frame(&mut self, header: &HandshakeHeader, reply: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 2 + reply.len());
        if !self.header_sent {
            out.extend_from_slice(&protocol::response_prefix(header));
            self.header_sent = true;
        }
        out.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        out.extend_from_slice(reply);
        out
    }

    async fn close(sender: &mut ClientSink, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
            debug!("Failed to send close frame: {e}");
        }
    }
}
