//! `tokio_util` codec for VTP frames.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{encode_frame_into, try_decode_frame};
use crate::types::{VtpError, DEFAULT_MAX_FRAME_LEN};

/// Frames and de-frames VTP payloads on a byte stream.
#[derive(Debug, Clone)]
pub struct VtpFrameCodec {
    max_frame_len: usize,
}

impl VtpFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for VtpFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for VtpFrameCodec {
    type Item = Bytes;
    type Error = VtpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        try_decode_frame(src, self.max_frame_len)
    }
}

impl Encoder<Bytes> for VtpFrameCodec {
    type Error = VtpError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn test_framed_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, VtpFrameCodec::default());
        let mut reader = FramedRead::new(server, VtpFrameCodec::default());

        writer.send(Bytes::from_static(b"<a/>")).await.unwrap();
        writer.send(Bytes::from_static(b"<b/>")).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap(), "<a/>");
        assert_eq!(reader.next().await.unwrap().unwrap(), "<b/>");
    }

    #[tokio::test]
    async fn test_oversized_frame_surfaces_as_error() {
        let stream = tokio_test::io::Builder::new()
            .read(&5000u32.to_be_bytes())
            .build();
        let mut reader = FramedRead::new(stream, VtpFrameCodec::new(1024));

        match reader.next().await {
            Some(Err(VtpError::FrameTooLarge { len: 5000, max: 1024 })) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
