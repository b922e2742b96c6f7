//! Wire framing: length-prefixed JSON objects over TCP.
//!
//! Both the command channel (request/reply) and the publish channel
//! (one-way broadcast) use the same framing: a 4-byte big-endian length
//! prefix followed by a JSON-encoded [`IecMsg`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::MtuError;
use crate::model::IecMsg;

/// Codec that frames [`IecMsg`] values as length-prefixed JSON.
#[derive(Debug)]
pub struct MtuCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MtuCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_type::<u32>()
                .max_frame_length(16 * 1024 * 1024)
                .new_codec(),
        }
    }
}

impl MtuCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MtuCodec {
    type Item = IecMsg;
    type Error = MtuError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src).map_err(MtuError::Io)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(frame.chunk())?;
        Ok(Some(msg))
    }
}

impl Encoder<IecMsg> for MtuCodec {
    type Error = MtuError;

    fn encode(&mut self, item: IecMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        let mut buf = BytesMut::with_capacity(payload.len());
        buf.put_slice(&payload);
        self.inner.encode(buf.freeze(), dst).map_err(MtuError::Io)
    }
}
