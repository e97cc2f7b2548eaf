//! Per-frame-type binary layouts.
//!
//! All integers are big-endian. Frame bodies start with the [`FrameType`]
//! byte; the transport adds its own length prefix around the body.
//!
//! | Frame | Layout |
//! |---|---|
//! | Push, Notify | `type \| i64 tid \| map head \| bool json \| payload` |
//! | Request | `type \| i64 src \| i64 tid \| map head \| bool json \| payload` |
//! | ResponseOk | `type \| i64 tid \| payload` |
//! | ResponseFail | `type \| i64 tid \| u16 code` |
//! | Watch | `type \| i64 node \| u16 count \| count x u16 method \| map meta` |
//! | Heartbeat | `type` |

use crate::frame::FrameType;
use crate::value::{need, Head};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hive_types::{HiveError, HiveResult, NodeId, Tid};

/// A decoded Push or Notify frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    pub tid: Tid,
    pub head: Head,
    pub json: bool,
    pub payload: Bytes,
}

/// Notify frames share the push layout.
pub type NotifyFrame = PushFrame;

/// A decoded Request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub src: NodeId,
    pub tid: Tid,
    pub head: Head,
    pub json: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOkFrame {
    pub tid: Tid,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFailFrame {
    pub tid: Tid,
    pub code: u16,
}

/// A watch subscription: `node` wants Notify frames for `codes`.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchFrame {
    pub node: NodeId,
    pub codes: Vec<u16>,
    pub meta: Head,
}

pub fn pack_heartbeat() -> Bytes {
    Bytes::from_static(&[FrameType::Heartbeat as u8])
}

pub fn pack_push(tid: Tid, head: &Head, json: bool, payload: &[u8]) -> HiveResult<Bytes> {
    pack_one_way(FrameType::Push, tid, head, json, payload)
}

pub fn pack_notify(tid: Tid, head: &Head, json: bool, payload: &[u8]) -> HiveResult<Bytes> {
    pack_one_way(FrameType::Notify, tid, head, json, payload)
}

fn pack_one_way(
    kind: FrameType,
    tid: Tid,
    head: &Head,
    json: bool,
    payload: &[u8],
) -> HiveResult<Bytes> {
    let mut buf = BytesMut::with_capacity(32 + payload.len());
    buf.put_u8(kind.as_u8());
    buf.put_i64(tid);
    head.encode(&mut buf)?;
    buf.put_u8(u8::from(json));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn pack_request(
    src: NodeId,
    tid: Tid,
    head: &Head,
    json: bool,
    payload: &[u8],
) -> HiveResult<Bytes> {
    let mut buf = BytesMut::with_capacity(40 + payload.len());
    buf.put_u8(FrameType::Request.as_u8());
    buf.put_i64(src);
    buf.put_i64(tid);
    head.encode(&mut buf)?;
    buf.put_u8(u8::from(json));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn pack_response_ok(tid: Tid, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    buf.put_u8(FrameType::ResponseOk.as_u8());
    buf.put_i64(tid);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn pack_response_fail(tid: Tid, code: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(FrameType::ResponseFail.as_u8());
    buf.put_i64(tid);
    buf.put_u16(code);
    buf.freeze()
}

pub fn pack_watch(node: NodeId, codes: &[u16], meta: &Head) -> HiveResult<Bytes> {
    let count = u16::try_from(codes.len())
        .map_err(|_| HiveError::Marshal(format!("watch with {} methods", codes.len())))?;
    let mut buf = BytesMut::with_capacity(16 + codes.len() * 2);
    buf.put_u8(FrameType::Watch.as_u8());
    buf.put_i64(node);
    buf.put_u16(count);
    for code in codes {
        buf.put_u16(*code);
    }
    meta.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Cursor over a frame body that checks the type byte up front.
struct Cursor<'a> {
    frame: &'a Bytes,
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn open(frame: &'a Bytes, expected: FrameType) -> HiveResult<Self> {
        let found = FrameType::of(frame)?;
        if found != expected {
            return Err(HiveError::unmarshal(
                "frame_type",
                format!("expected {expected}, found {found}"),
            ));
        }
        Ok(Self {
            frame,
            rest: &frame[1..],
        })
    }

    fn i64(&mut self, field: &'static str) -> HiveResult<i64> {
        need(self.rest, 8, field)?;
        Ok(self.rest.get_i64())
    }

    fn u16(&mut self, field: &'static str) -> HiveResult<u16> {
        need(self.rest, 2, field)?;
        Ok(self.rest.get_u16())
    }

    fn bool(&mut self, field: &'static str) -> HiveResult<bool> {
        need(self.rest, 1, field)?;
        Ok(self.rest.get_u8() != 0)
    }

    fn head(&mut self) -> HiveResult<Head> {
        Head::decode(&mut self.rest)
    }

    /// Everything left, sliced from the original buffer without copying.
    fn payload(self) -> Bytes {
        let start = self.frame.len() - self.rest.len();
        self.frame.slice(start..)
    }

    fn finish(self, field: &'static str) -> HiveResult<()> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(HiveError::unmarshal(
                field,
                format!("{} trailing bytes", self.rest.len()),
            ))
        }
    }
}

pub fn unpack_push(frame: &Bytes) -> HiveResult<PushFrame> {
    unpack_one_way(frame, FrameType::Push)
}

pub fn unpack_notify(frame: &Bytes) -> HiveResult<NotifyFrame> {
    unpack_one_way(frame, FrameType::Notify)
}

fn unpack_one_way(frame: &Bytes, kind: FrameType) -> HiveResult<PushFrame> {
    let mut cur = Cursor::open(frame, kind)?;
    let tid = cur.i64("tid")?;
    let head = cur.head()?;
    let json = cur.bool("json")?;
    Ok(PushFrame {
        tid,
        head,
        json,
        payload: cur.payload(),
    })
}

pub fn unpack_request(frame: &Bytes) -> HiveResult<RequestFrame> {
    let mut cur = Cursor::open(frame, FrameType::Request)?;
    let src = cur.i64("src")?;
    let tid = cur.i64("tid")?;
    let head = cur.head()?;
    let json = cur.bool("json")?;
    Ok(RequestFrame {
        src,
        tid,
        head,
        json,
        payload: cur.payload(),
    })
}

pub fn unpack_response_ok(frame: &Bytes) -> HiveResult<ResponseOkFrame> {
    let mut cur = Cursor::open(frame, FrameType::ResponseOk)?;
    let tid = cur.i64("tid")?;
    Ok(ResponseOkFrame {
        tid,
        payload: cur.payload(),
    })
}

pub fn unpack_response_fail(frame: &Bytes) -> HiveResult<ResponseFailFrame> {
    let mut cur = Cursor::open(frame, FrameType::ResponseFail)?;
    let tid = cur.i64("tid")?;
    let code = cur.u16("code")?;
    cur.finish("code")?;
    Ok(ResponseFailFrame { tid, code })
}

pub fn unpack_watch(frame: &Bytes) -> HiveResult<WatchFrame> {
    let mut cur = Cursor::open(frame, FrameType::Watch)?;
    let node = cur.i64("node")?;
    let count = cur.u16("count")? as usize;
    need(cur.rest, count * 2, "codes")?;
    let mut codes = Vec::with_capacity(count);
    for _ in 0..count {
        codes.push(cur.u16("codes")?);
    }
    let meta = cur.head()?;
    cur.finish("meta")?;
    Ok(WatchFrame { node, codes, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head() -> Head {
        let mut head = Head::new().with("trace", "abc");
        head.set_svc(3);
        head.set_code(1);
        head.set_src(9);
        head
    }

    #[test]
    fn test_request_roundtrip_with_and_without_payload() {
        let head = sample_head();
        for payload in [&b""[..], &b"{\"x\":1}"[..]] {
            let frame = pack_request(9, 77, &head, true, payload).unwrap();
            assert_eq!(FrameType::of(&frame).unwrap(), FrameType::Request);
            let out = unpack_request(&frame).unwrap();
            assert_eq!(out.src, 9);
            assert_eq!(out.tid, 77);
            assert_eq!(out.head, head);
            assert!(out.json);
            assert_eq!(&out.payload[..], payload);
        }
    }

    #[test]
    fn test_push_and_notify_are_distinct_types() {
        let head = sample_head();
        let push = pack_push(5, &head, false, b"\x01\x02").unwrap();
        let notify = pack_notify(5, &head, false, b"\x01\x02").unwrap();
        assert_eq!(push[0], 2);
        assert_eq!(notify[0], 7);
        assert_eq!(unpack_push(&push).unwrap(), unpack_notify(&notify).unwrap());
        assert!(unpack_push(&notify).is_err());
    }

    #[test]
    fn test_push_layout_is_exact() {
        let frame = pack_push(1, &Head::new(), true, b"z").unwrap();
        assert_eq!(&frame[..], &[2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, b'z']);
    }

    #[test]
    fn test_responses() {
        let ok = pack_response_ok(-4, b"done");
        let out = unpack_response_ok(&ok).unwrap();
        assert_eq!(out.tid, -4);
        assert_eq!(&out.payload[..], b"done");

        let fail = pack_response_fail(12, 1234);
        assert_eq!(fail.len(), 11);
        assert_eq!(
            unpack_response_fail(&fail).unwrap(),
            ResponseFailFrame { tid: 12, code: 1234 }
        );
    }

    #[test]
    fn test_watch_roundtrip() {
        let meta = Head::new().with("zone", "eu");
        let frame = pack_watch(3, &[5001, 5002], &meta).unwrap();
        let out = unpack_watch(&frame).unwrap();
        assert_eq!(out.node, 3);
        assert_eq!(out.codes, vec![5001, 5002]);
        assert_eq!(out.meta, meta);
    }

    #[test]
    fn test_truncation_reports_field() {
        let frame = pack_request(1, 2, &sample_head(), false, b"").unwrap();
        let cut = frame.slice(..5);
        assert!(matches!(
            unpack_request(&cut),
            Err(HiveError::Unmarshal { field: "src", .. })
        ));
        let cut = frame.slice(..12);
        assert!(matches!(
            unpack_request(&cut),
            Err(HiveError::Unmarshal { field: "tid", .. })
        ));
        let fail = pack_response_fail(1, 2).slice(..10);
        assert!(matches!(
            unpack_response_fail(&fail),
            Err(HiveError::Unmarshal { field: "code", .. })
        ));
    }

    #[test]
    fn test_watch_count_beyond_buffer() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::Watch.as_u8());
        buf.put_i64(1);
        buf.put_u16(500);
        let frame = buf.freeze();
        assert!(matches!(
            unpack_watch(&frame),
            Err(HiveError::Unmarshal { field: "codes", .. })
        ));
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(&pack_heartbeat()[..], &[1]);
    }
}
