// Wire format for framing bridge traffic on the network.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub mod io;

pub const MAGIC: u32 = 0x54525331; // "TRS1"
pub const VERSION: u16 = 1;
// Flags describe how to interpret the frame payload. Flag 0 carries a JSON
// control `Message`.
pub const FLAG_PUBLISH: u16 = 0x0001;
pub const FLAG_PUSH: u16 = 0x0002;
pub const FLAG_PULL: u16 = 0x0004;
pub const FLAG_BULK: u16 = 0x0008;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Stamp the current magic and version onto a new header.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Everything on the wire is big-endian.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Check magic and version before believing the length field.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// One unit of bridge traffic: a twelve-byte header plus an opaque payload.
///
/// ```
/// use bytes::Bytes;
/// use trestle_wire::Frame;
///
/// let frame = Frame::new(0x1, Bytes::from_static(b"ping")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"ping"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // The length field is a u32; larger payloads cannot be framed.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Exact-size allocation, header plus payload.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // The declared length decides where the payload ends.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Control messages carried in flag-0 frames.
///
/// ```
/// use trestle_wire::Message;
///
/// let message = Message::Subscribe { topic: "updates".to_string() };
/// let frame = message.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Register interest in a topic on the consumer-facing socket.
    Subscribe { topic: String },
    // Drop interest in a topic.
    Unsubscribe { topic: String },
    // Affirmative reply to a control request.
    Ok,
    // Sent back when a request is malformed or arrives on the wrong socket.
    Error { message: String },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        // Control traffic is JSON in a flag-0 frame.
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }
}

pub mod pubsub {
    //! Publish framing: `topic-bytes + single-space + payload-bytes`.
    //!
    //! The topic is normalized before it reaches the wire (spaces replaced
    //! with underscores), so the first space byte always separates topic and
    //! payload. The payload is binary-safe.
    use super::*;

    pub fn encode_publish(topic: &str, payload: &Bytes) -> Result<Frame> {
        if topic.is_empty() || topic.contains(' ') {
            return Err(Error::Malformed("publish topic"));
        }
        let mut buf = BytesMut::with_capacity(topic.len() + 1 + payload.len());
        buf.extend_from_slice(topic.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(payload);
        Frame::new(FLAG_PUBLISH, buf.freeze())
    }

    pub fn decode_publish(frame: &Frame) -> Result<(String, Bytes)> {
        let separator = frame
            .payload
            .iter()
            .position(|byte| *byte == b' ')
            .ok_or(Error::Malformed("publish"))?;
        let topic_bytes = frame.payload.slice(0..separator);
        let topic = String::from_utf8(topic_bytes.to_vec())
            .map_err(|_| Error::InvalidUtf8("publish topic"))?;
        if topic.is_empty() {
            return Err(Error::Malformed("publish topic"));
        }
        let payload = frame.payload.slice(separator + 1..);
        Ok((topic, payload))
    }
}

pub mod queue {
    //! Queue framing: two length-delimited parts per frame, the queue name
    //! followed by zero or more opaque serialized messages.
    use bytes::BufMut;

    use super::*;

    fn put_qname(buf: &mut BytesMut, qname: &str) -> Result<()> {
        let bytes = qname.as_bytes();
        let len = u16::try_from(bytes.len()).map_err(|_| Error::FrameTooLarge)?;
        buf.put_u16(len);
        buf.extend_from_slice(bytes);
        Ok(())
    }

    fn take_qname(buf: &mut Bytes) -> Result<String> {
        if buf.remaining() < 2 {
            return Err(Error::Incomplete);
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Error::Incomplete);
        }
        let raw = buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8("queue name"))
    }

    fn put_payloads(buf: &mut BytesMut, payloads: &[Bytes]) -> Result<()> {
        buf.put_u32(payloads.len() as u32);
        for payload in payloads {
            let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge)?;
            buf.put_u32(len);
            buf.extend_from_slice(payload);
        }
        Ok(())
    }

    fn take_payloads(buf: &mut Bytes) -> Result<Vec<Bytes>> {
        if buf.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        let count = buf.get_u32() as usize;
        let mut payloads = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(Error::Incomplete);
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Incomplete);
            }
            payloads.push(buf.copy_to_bytes(len));
        }
        Ok(payloads)
    }

    fn encode_parts(flags: u16, qname: &str, payloads: &[Bytes]) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_qname(&mut buf, qname)?;
        put_payloads(&mut buf, payloads)?;
        Frame::new(flags, buf.freeze())
    }

    fn decode_parts(frame: &Frame, what: &'static str) -> Result<(String, Vec<Bytes>)> {
        let mut buf = frame.payload.clone();
        let qname = take_qname(&mut buf)?;
        let payloads = take_payloads(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Malformed(what));
        }
        Ok((qname, payloads))
    }

    pub fn encode_push(qname: &str, payloads: &[Bytes]) -> Result<Frame> {
        encode_parts(FLAG_PUSH, qname, payloads)
    }

    pub fn decode_push(frame: &Frame) -> Result<(String, Vec<Bytes>)> {
        decode_parts(frame, "push")
    }

    pub fn encode_pull(qname: &str) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_qname(&mut buf, qname)?;
        Frame::new(FLAG_PULL, buf.freeze())
    }

    pub fn decode_pull(frame: &Frame) -> Result<String> {
        let mut buf = frame.payload.clone();
        let qname = take_qname(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Malformed("pull"));
        }
        Ok(qname)
    }

    pub fn encode_bulk(qname: &str, payloads: &[Bytes]) -> Result<Frame> {
        encode_parts(FLAG_BULK, qname, payloads)
    }

    pub fn decode_bulk(frame: &Frame) -> Result<(String, Vec<Bytes>)> {
        decode_parts(frame, "bulk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        // Header and payload survive an encode/decode cycle.
        let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
        assert_eq!(decoded.header.flags, 0x1);
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let header = FrameHeader::new(0, 5);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete payload");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn publish_round_trip() {
        let payload = Bytes::from_static(b"binary \x00 payload with spaces");
        let frame = pubsub::encode_publish("sensor_data", &payload).expect("encode");
        assert_eq!(frame.header.flags, FLAG_PUBLISH);
        let (topic, decoded) = pubsub::decode_publish(&frame).expect("decode");
        assert_eq!(topic, "sensor_data");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn publish_rejects_unnormalized_topic() {
        let err = pubsub::encode_publish("has space", &Bytes::new()).expect_err("space");
        assert!(matches!(err, Error::Malformed("publish topic")));
    }

    #[test]
    fn publish_decode_rejects_missing_separator() {
        let frame = Frame::new(FLAG_PUBLISH, Bytes::from_static(b"nospace")).expect("frame");
        let err = pubsub::decode_publish(&frame).expect_err("no separator");
        assert!(matches!(err, Error::Malformed("publish")));
    }

    #[test]
    fn push_round_trip() {
        let payloads = vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")];
        let frame = queue::encode_push("jobs", &payloads).expect("encode");
        assert_eq!(frame.header.flags, FLAG_PUSH);
        let (qname, decoded) = queue::decode_push(&frame).expect("decode");
        assert_eq!(qname, "jobs");
        assert_eq!(decoded, payloads);
    }

    #[test]
    fn pull_round_trip() {
        let frame = queue::encode_pull("jobs").expect("encode");
        assert_eq!(frame.header.flags, FLAG_PULL);
        assert_eq!(queue::decode_pull(&frame).expect("decode"), "jobs");
    }

    #[test]
    fn empty_bulk_is_representable() {
        let frame = queue::encode_bulk("jobs", &[]).expect("encode");
        let (qname, payloads) = queue::decode_bulk(&frame).expect("decode");
        assert_eq!(qname, "jobs");
        assert!(payloads.is_empty());
    }

    #[test]
    fn queue_decode_rejects_truncated_parts() {
        let frame = Frame::new(FLAG_PUSH, Bytes::from_static(b"\x00\x04jo")).expect("frame");
        let err = queue::decode_push(&frame).expect_err("truncated");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn message_round_trip() {
        let message = Message::Subscribe {
            topic: "updates".to_string(),
        };
        let frame = message.encode().expect("encode");
        let decoded = Message::decode(frame).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn message_error_round_trip() {
        let message = Message::Error {
            message: "oops".to_string(),
        };
        let frame = message.encode().expect("encode");
        let decoded = Message::decode(frame).expect("decode");
        assert_eq!(message, decoded);
    }
}
