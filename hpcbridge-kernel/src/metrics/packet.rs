//! Fixed-layout counter packet, little-endian:
//!
//! ```text
//! i32 version | 16 bytes node uuid (mixed-endian GUID layout) | i32 count | i32 tick count
//! 80 x (u16 metric id, u16 instance id) | 80 x f32 value | zero padding up to 1024 bytes
//! ```
//!
//! Slots past `count` are always zero.

use crate::models::Umid;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

pub const WIRE_VERSION: i32 = 1;
pub const MAX_COUNTERS_IN_PACKET: usize = 80;
pub const MAX_PACKET_SIZE: usize = 1024;
const HEADER_SIZE: usize = 4 + 16 + 4 + 4;
pub const PACKET_LAYOUT_SIZE: usize = HEADER_SIZE + MAX_COUNTERS_IN_PACKET * 4 + MAX_COUNTERS_IN_PACKET * 4;

// Every packet fits its datagram; there is no oversize path.
const _: () = assert!(PACKET_LAYOUT_SIZE <= MAX_PACKET_SIZE);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("{umids} counter ids but {values} values")]
    LengthMismatch { umids: usize, values: usize },
    #[error("{0} counters do not fit in one packet")]
    TooManyCounters(usize),
    #[error("packet is {0} bytes, expected at least 668")]
    Truncated(usize),
    #[error("unsupported packet version {0}")]
    Version(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterWirePacket {
    pub node_id: Uuid,
    pub tick_count: i32,
    pub umids: Vec<Umid>,
    pub values: Vec<f32>,
}

impl CounterWirePacket {
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let count = self.umids.len();
        if count != self.values.len() {
            return Err(PacketError::LengthMismatch { umids: count, values: self.values.len() });
        }
        if count > MAX_COUNTERS_IN_PACKET {
            return Err(PacketError::TooManyCounters(count));
        }

        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        buf.put_i32_le(WIRE_VERSION);
        buf.put_slice(&self.node_id.to_bytes_le());
        buf.put_i32_le(count as i32);
        buf.put_i32_le(self.tick_count);
        for slot in 0..MAX_COUNTERS_IN_PACKET {
            let umid = self.umids.get(slot).copied().unwrap_or(Umid { metric_id: 0, instance_id: 0 });
            buf.put_u16_le(umid.metric_id);
            buf.put_u16_le(umid.instance_id);
        }
        for slot in 0..MAX_COUNTERS_IN_PACKET {
            buf.put_f32_le(self.values.get(slot).copied().unwrap_or(0.0));
        }
        buf.resize(MAX_PACKET_SIZE, 0);
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < PACKET_LAYOUT_SIZE {
            return Err(PacketError::Truncated(raw.len()));
        }
        let mut buf = raw;
        let version = buf.get_i32_le();
        if version != WIRE_VERSION {
            return Err(PacketError::Version(version));
        }
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let count = buf.get_i32_le();
        let count = usize::try_from(count)
            .ok()
            .filter(|c| *c <= MAX_COUNTERS_IN_PACKET)
            .ok_or(PacketError::TooManyCounters(count.max(0) as usize))?;
        let tick_count = buf.get_i32_le();

        let mut umids = Vec::with_capacity(count);
        for slot in 0..MAX_COUNTERS_IN_PACKET {
            let metric_id = buf.get_u16_le();
            let instance_id = buf.get_u16_le();
            if slot < count {
                umids.push(Umid { metric_id, instance_id });
            }
        }
        let mut values = Vec::with_capacity(count);
        for slot in 0..MAX_COUNTERS_IN_PACKET {
            let value = buf.get_f32_le();
            if slot < count {
                values.push(value);
            }
        }

        Ok(Self { node_id: Uuid::from_bytes_le(uuid), tick_count, umids, values })
    }
}

/// Splits a sample batch into packets of at most 80 counters.
pub fn chunk(
    node_id: Uuid,
    umids: &[Umid],
    values: &[f32],
    tick_count: i32,
) -> Result<Vec<CounterWirePacket>, PacketError> {
    if umids.len() != values.len() {
        return Err(PacketError::LengthMismatch { umids: umids.len(), values: values.len() });
    }
    Ok(umids
        .chunks(MAX_COUNTERS_IN_PACKET)
        .zip(values.chunks(MAX_COUNTERS_IN_PACKET))
        .map(|(u, v)| CounterWirePacket {
            node_id,
            tick_count,
            umids: u.to_vec(),
            values: v.to_vec(),
        })
        .collect())
}
