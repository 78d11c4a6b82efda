use crate::{
    dns::{self, Error, MAX_DATAGRAM_LEN},
    parser,
};

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Datagram codec for `UdpFramed`: one buffer holds exactly one DNS message.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Decoder for Codec {
    type Item = dns::Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        log::debug!("Unpacking DNS message of {} bytes.", buf.len());

        // a datagram is never continued, so whatever happens the buffer is
        // consumed; otherwise `UdpFramed` would decode it again
        let result = if buf.len() > MAX_DATAGRAM_LEN {
            Err(Error::OversizedMessage(buf.len()))
        } else {
            parser::message(buf)
        };
        buf.clear();

        result.map(Some)
    }
}

impl Encoder<dns::Message> for Codec {
    type Error = Error;

    /// Writes `message` as a single datagram.
    ///
    /// A message that does not fit into 512 bytes is sent without its answers
    /// and with the TC bit set. If even that is too long nothing is written.
    fn encode(&mut self, message: dns::Message, buf: &mut BytesMut) -> Result<(), Error> {
        let mut data: Vec<u8> = (&message).into();

        if data.len() > MAX_DATAGRAM_LEN {
            log::warn!(
                "Response {} is {} bytes long, truncating",
                message.header.id,
                data.len()
            );

            let truncated = dns::Message {
                header: dns::Header {
                    truncated: true,
                    an_count: 0,
                    ..message.header
                },
                answers: vec![],
                ..message
            };
            data = (&truncated).into();

            if data.len() > MAX_DATAGRAM_LEN {
                return Err(Error::OversizedMessage(data.len()));
            }
        }

        buf.reserve(data.len());
        buf.put(data.as_ref());
        Ok(())
    }
}
