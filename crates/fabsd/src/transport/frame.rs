// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram framing for the UDP transport.
//!
//! ```text
//!  0        1        2                 4                 6        7        8
//! +--------+--------+-----------------+-----------------+--------+--------+
//! |version | method |     status      |    attribute    | flags  |  rsvd  |
//! +--------+--------+-----------------+-----------------+--------+--------+
//! |                      transaction id (u64)                             |
//! +-----------------------------------+-----------------+-----------------+
//! |        segment number (u32)       |  payload length |      rsvd       |
//! +-----------------------------------+-----------------+-----------------+
//! |                      component mask (u64)                             |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! All fields big-endian. The payload follows the 32-byte header.

use super::{Datagram, Response, ResponseKind, Segment};
use crate::error::{Result, SdError};
use crate::types::{MadStatus, Method, PortGuid, TransactionId};

pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 32;

const FLAG_SEGMENTED: u8 = 0x01;
const FLAG_LAST: u8 = 0x02;
const FLAG_SEND_ERROR: u8 = 0x04;

/// One framed datagram, either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub method: Method,
    pub status: MadStatus,
    pub attribute: u16,
    pub tid: TransactionId,
    pub segment: Option<Segment>,
    pub send_error: bool,
    pub component_mask: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn request(datagram: &Datagram) -> Self {
        Self {
            method: datagram.method,
            status: MadStatus::SUCCESS,
            attribute: datagram.attribute,
            tid: datagram.tid,
            segment: None,
            send_error: false,
            component_mask: datagram.component_mask,
            payload: datagram.payload.clone(),
        }
    }

    /// Reply to `request` carrying `status` and `payload`.
    #[must_use]
    pub fn reply_to(request: &Frame, status: MadStatus, payload: Vec<u8>) -> Self {
        Self {
            method: request.method,
            status,
            attribute: request.attribute,
            tid: request.tid,
            segment: None,
            send_error: false,
            component_mask: 0,
            payload,
        }
    }

    #[must_use]
    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segment = Some(segment);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            SdError::InvalidParameter(format!("payload of {} bytes", self.payload.len()))
        })?;
        let mut flags = 0u8;
        if let Some(seg) = self.segment {
            flags |= FLAG_SEGMENTED;
            if seg.last {
                flags |= FLAG_LAST;
            }
        }
        if self.send_error {
            flags |= FLAG_SEND_ERROR;
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(FRAME_VERSION);
        buf.push(self.method.code());
        buf.extend_from_slice(&self.status.0.to_be_bytes());
        buf.extend_from_slice(&self.attribute.to_be_bytes());
        buf.push(flags);
        buf.push(0);
        buf.extend_from_slice(&self.tid.0.to_be_bytes());
        buf.extend_from_slice(&self.segment.map(|s| s.number).unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.component_mask.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(SdError::MalformedResponse(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != FRAME_VERSION {
            return Err(SdError::MalformedResponse(format!(
                "unsupported frame version {}",
                buf[0]
            )));
        }
        let method = Method::from_code(buf[1])
            .ok_or_else(|| SdError::MalformedResponse(format!("unknown method 0x{:02x}", buf[1])))?;
        let flags = buf[6];
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&buf[8..16]);
        let number = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let len = usize::from(u16::from_be_bytes([buf[20], buf[21]]));
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&buf[24..32]);
        let body = &buf[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(SdError::MalformedResponse(format!(
                "payload length {} but {} bytes present",
                len,
                body.len()
            )));
        }
        let segment = (flags & FLAG_SEGMENTED != 0).then_some(Segment {
            number,
            last: flags & FLAG_LAST != 0,
        });
        Ok(Self {
            method,
            status: MadStatus(u16::from_be_bytes([buf[2], buf[3]])),
            attribute: u16::from_be_bytes([buf[4], buf[5]]),
            tid: TransactionId(u64::from_be_bytes(tid)),
            segment,
            send_error: flags & FLAG_SEND_ERROR != 0,
            component_mask: u64::from_be_bytes(mask),
            payload: body.to_vec(),
        })
    }

    /// Inbound frame as seen by the engine.
    #[must_use]
    pub fn into_response(self, port: PortGuid) -> Response {
        let kind = if self.send_error {
            ResponseKind::SendError
        } else {
            ResponseKind::Reply {
                status: self.status,
                segment: self.segment,
            }
        };
        Response {
            port,
            tid: self.tid,
            kind,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Datagram {
        Datagram {
            tid: TransactionId(0xabcd_00),
            method: Method::GetTable,
            attribute: 0x0035,
            component_mask: 0x3,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_request_layout() {
        let buf = Frame::request(&sample()).encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 4);
        assert_eq!(buf[0], FRAME_VERSION);
        assert_eq!(buf[1], Method::GetTable.code());
        assert_eq!(&buf[8..16], &0xabcd_00u64.to_be_bytes());
        assert_eq!(&buf[24..32], &3u64.to_be_bytes());

        let back = Frame::decode(&buf).unwrap();
        assert_eq!(back.component_mask, 3);
        assert_eq!(back.payload, vec![1, 2, 3, 4]);
        assert!(back.segment.is_none());
    }

    #[test]
    fn test_segmented_reply_to_response() {
        let req = Frame::request(&sample());
        let reply = Frame::reply_to(&req, MadStatus::SUCCESS, vec![9; 10]).with_segment(Segment {
            number: 2,
            last: true,
        });
        let resp = Frame::decode(&reply.encode().unwrap())
            .unwrap()
            .into_response(PortGuid(7));
        assert_eq!(resp.port, PortGuid(7));
        assert_eq!(resp.tid, TransactionId(0xabcd_00));
        assert_eq!(
            resp.kind,
            ResponseKind::Reply {
                status: MadStatus::SUCCESS,
                segment: Some(Segment { number: 2, last: true })
            }
        );
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut buf = Frame::request(&sample()).encode().unwrap();
        assert!(Frame::decode(&buf[..16]).is_err());

        buf.push(0xff); // trailing byte
        assert!(Frame::decode(&buf).is_err());

        let mut buf = Frame::request(&sample()).encode().unwrap();
        buf[0] = 9;
        assert!(Frame::decode(&buf).is_err());

        let mut buf = Frame::request(&sample()).encode().unwrap();
        buf[1] = 0x7f;
        assert!(Frame::decode(&buf).is_err());
    }
}
