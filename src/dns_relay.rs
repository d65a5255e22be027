//! Length-prefixed UDP datagram framing and the DNS-over-HTTPS forwarder.
//!
//! UDP traffic inside the tunnel carries zero or more frames per message,
//! each a 2-byte big-endian length followed by exactly that many bytes of
//! raw DNS wire-format query. Each complete frame becomes one POST to the
//! configured resolver; replies travel back in the same framing.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use reqwest::header;

/// Media type for DNS wire format over HTTPS (RFC 8484).
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Forwards raw DNS queries to a DNS-over-HTTPS resolver.
///
/// Cheap to clone; the underlying HTTP client is shared.
#[derive(Clone, Debug)]
pub struct DnsRelay {
    client: reqwest::Client,
    endpoint: String,
}

impl DnsRelay {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build DNS-over-HTTPS client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one raw DNS query and returns the raw answer bytes.
    ///
    /// No timeout is applied here; the call waits until the transport gives
    /// up or errors. A non-success HTTP status is an error.
    pub async fn query(&self, packet: &[u8]) -> Result<Bytes> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(packet.to_vec())
            .send()
            .await
            .with_context(|| format!("DNS-over-HTTPS request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "DNS-over-HTTPS request to {} returned HTTP {status}",
                self.endpoint
            );
        }

        response
            .bytes()
            .await
            .context("Failed to read DNS-over-HTTPS response body")
    }
}

/// Splits a tunnel chunk into complete length-prefixed datagram frames.
///
/// Returns the frames along with the number of trailing bytes that do not
/// form a complete frame. The trailing remainder is discarded by the caller,
/// never buffered across messages: a frame split across message boundaries
/// is lost by design.
#[must_use]
pub fn split_frames(chunk: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;

    while chunk.len() - offset >= 2 {
        let length = usize::from(u16::from_be_bytes([chunk[offset], chunk[offset + 1]]));
        let start = offset + 2;
        let end = start + length;
        if end > chunk.len() {
            break;
        }
        frames.push(&chunk[start..end]);
        offset = end;
    }

    (frames, chunk.len() - offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn splits_two_back_to_back_frames() {
        let mut chunk = frame(b"first");
        chunk.extend_from_slice(&frame(b"second"));

        let (frames, discarded) = split_frames(&chunk);
        assert_eq!(frames, vec![b"first".as_slice(), b"second".as_slice()]);
        assert_eq!(discarded, 0);
    }

    #[test]
    fn discards_trailing_partial_payload() {
        let mut chunk = frame(b"whole");
        chunk.extend_from_slice(&[0x00, 0x10, 0xaa, 0xbb]); // claims 16 bytes, has 2

        let (frames, discarded) = split_frames(&chunk);
        assert_eq!(frames, vec![b"whole".as_slice()]);
        assert_eq!(discarded, 4);
    }

    #[test]
    fn discards_lone_length_byte() {
        let mut chunk = frame(b"ok");
        chunk.push(0x00);

        let (frames, discarded) = split_frames(&chunk);
        assert_eq!(frames, vec![b"ok".as_slice()]);
        assert_eq!(discarded, 1);
    }

    #[test]
    fn handles_empty_chunk() {
        let (frames, discarded) = split_frames(&[]);
        assert!(frames.is_empty());
        assert_eq!(discarded, 0);
    }

    #[test]
    fn zero_length_frame_is_complete() {
        let (frames, discarded) = split_frames(&[0x00, 0x00]);
        assert_eq!(frames, vec![b"".as_slice()]);
        assert_eq!(discarded, 0);
    }

    #[test]
    fn frame_exactly_filling_the_chunk() {
        let chunk = frame(&[0xab; 300]);
        let (frames, discarded) = split_frames(&chunk);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 300);
        assert_eq!(discarded, 0);
    }
}
