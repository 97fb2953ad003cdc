// Low-level frame IO over any async byte stream.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Frame, FrameHeader, Result};

/// Read one frame, or `None` on clean end-of-stream.
///
/// The scratch buffer is reused across calls to avoid per-frame allocations.
/// The declared payload length is checked against `max_frame_bytes` before
/// any allocation so a bad peer cannot force huge buffers.
pub async fn read_frame<R>(
    recv: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    let mut filled = 0;
    while filled < FrameHeader::LEN {
        let n = recv.read(&mut header_bytes[filled..]).await?;
        if n == 0 {
            // EOF at a frame boundary is a clean close; inside a header it
            // is a truncated stream.
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Incomplete);
        }
        filled += n;
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge);
    }

    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..]).await?;

    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

/// Write one frame, header then payload.
pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes).await?;
    send.write_all(&frame.payload).await?;
    send.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn frame_io_round_trip() {
        let frame = Frame::new(0x2, Bytes::from_static(b"payload")).expect("frame");
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.expect("write");

        let mut reader = &wire[..];
        let mut scratch = BytesMut::new();
        let decoded = read_frame(&mut reader, &mut scratch, TEST_MAX)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(decoded, frame);

        // Stream is exhausted: next read reports clean EOF.
        let eof = read_frame(&mut reader, &mut scratch, TEST_MAX)
            .await
            .expect("read");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_allocation() {
        let header = FrameHeader::new(0, u32::MAX);
        let mut header_bytes = [0u8; FrameHeader::LEN];
        header.encode_into(&mut header_bytes);

        let mut reader = &header_bytes[..];
        let mut scratch = BytesMut::new();
        let err = read_frame(&mut reader, &mut scratch, 16)
            .await
            .expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge));
    }

    #[tokio::test]
    async fn eof_inside_a_header_is_incomplete_not_clean() {
        let header = FrameHeader::new(0, 4);
        let mut header_bytes = [0u8; FrameHeader::LEN];
        header.encode_into(&mut header_bytes);

        // Stream dies five bytes into the twelve-byte header.
        let mut reader = &header_bytes[..5];
        let mut scratch = BytesMut::new();
        let err = read_frame(&mut reader, &mut scratch, TEST_MAX)
            .await
            .expect_err("truncated header");
        assert!(matches!(err, Error::Incomplete));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_io_error() {
        let frame = Frame::new(0, Bytes::from_static(b"full payload")).expect("frame");
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.expect("write");
        wire.truncate(wire.len() - 4);

        let mut reader = &wire[..];
        let mut scratch = BytesMut::new();
        let err = read_frame(&mut reader, &mut scratch, TEST_MAX)
            .await
            .expect_err("truncated");
        assert!(matches!(err, Error::Io(_)));
    }
}
