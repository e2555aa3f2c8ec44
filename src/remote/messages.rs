//! Active-message wire format.
//!
//! Frames are small and fixed-layout: a kind byte followed by little-endian
//! fields. They must fit the pre-posted receive buffers of the message
//! queue, which the senders enforce.

use crate::dep::{GlobalPtr, Phase, SegmentId, UnitId};
use crate::error::{Result, TaskError};
use crate::task::TaskId;

const KIND_REQUEST_DEP: u8 = 1;
const KIND_RELEASE_DEP: u8 = 2;
const KIND_SEND_REQUEST: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteMessage {
    /// Consumer asks the owner of `key` to ship a completion notification
    /// once the matching producer of `phase` finished.
    RequestDep {
        key: GlobalPtr,
        phase: Phase,
        requester: UnitId,
        consumer: TaskId,
    },
    /// Producer-side notification releasing one remote dependency of
    /// `consumer` on the requesting unit.
    ReleaseDep { consumer: TaskId },
    /// Copy-in send request: the owner of `src` shall create a deferred send
    /// task shipping `size` bytes under `tag`.
    SendRequest {
        src: GlobalPtr,
        size: u64,
        tag: u32,
        phase: Phase,
        requester: UnitId,
    },
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(TaskError::Inval("truncated remote message"));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }
}

fn put_gptr(out: &mut Vec<u8>, ptr: GlobalPtr) {
    out.extend_from_slice(&ptr.unit.0.to_le_bytes());
    out.extend_from_slice(&ptr.segment.0.to_le_bytes());
    out.extend_from_slice(&ptr.offset.to_le_bytes());
}

fn read_gptr(r: &mut Reader<'_>) -> Result<GlobalPtr> {
    Ok(GlobalPtr {
        unit: UnitId(r.u32()?),
        segment: SegmentId(r.u16()?),
        offset: r.u64()?,
    })
}

impl RemoteMessage {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        match self {
            RemoteMessage::RequestDep {
                key,
                phase,
                requester,
                consumer,
            } => {
                out.push(KIND_REQUEST_DEP);
                put_gptr(&mut out, *key);
                out.extend_from_slice(&phase.to_le_bytes());
                out.extend_from_slice(&requester.0.to_le_bytes());
                out.extend_from_slice(&consumer.0.to_le_bytes());
            }
            RemoteMessage::ReleaseDep { consumer } => {
                out.push(KIND_RELEASE_DEP);
                out.extend_from_slice(&consumer.0.to_le_bytes());
            }
            RemoteMessage::SendRequest {
                src,
                size,
                tag,
                phase,
                requester,
            } => {
                out.push(KIND_SEND_REQUEST);
                put_gptr(&mut out, *src);
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&phase.to_le_bytes());
                out.extend_from_slice(&requester.0.to_le_bytes());
            }
        }
        out
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        match r.u8()? {
            KIND_REQUEST_DEP => Ok(RemoteMessage::RequestDep {
                key: read_gptr(&mut r)?,
                phase: r.i32()?,
                requester: UnitId(r.u32()?),
                consumer: TaskId(r.u64()?),
            }),
            KIND_RELEASE_DEP => Ok(RemoteMessage::ReleaseDep {
                consumer: TaskId(r.u64()?),
            }),
            KIND_SEND_REQUEST => Ok(RemoteMessage::SendRequest {
                src: read_gptr(&mut r)?,
                size: r.u64()?,
                tag: r.u32()?,
                phase: r.i32()?,
                requester: UnitId(r.u32()?),
            }),
            _ => Err(TaskError::Inval("unknown remote message kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request_dep() {
        let msg = RemoteMessage::RequestDep {
            key: GlobalPtr::new(UnitId(3), SegmentId(7), 0x1234),
            phase: 5,
            requester: UnitId(1),
            consumer: TaskId(42),
        };
        assert_eq!(RemoteMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn roundtrip_send_request() {
        let msg = RemoteMessage::SendRequest {
            src: GlobalPtr::new(UnitId(0), SegmentId(2), 64),
            size: 1024,
            tag: 9,
            phase: 0,
            requester: UnitId(1),
        };
        assert_eq!(RemoteMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(RemoteMessage::decode(&[]).is_err());
        assert!(RemoteMessage::decode(&[0xFF, 1, 2]).is_err());
        assert!(RemoteMessage::decode(&[KIND_REQUEST_DEP, 1]).is_err());
    }
}
