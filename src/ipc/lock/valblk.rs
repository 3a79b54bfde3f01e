/*!
 * Value Block
 *
 * The 32-byte payload attached to a negotiation lock: two 16-byte slots,
 * one per peer, little endian:
 *
 * | offset | field    |
 * |--------|----------|
 * | 0      | pid      |
 * | 4      | instance |
 * | 8      | flags (bits 0-5) and stream id (bits 16-31) |
 * | 12     | reserved |
 */

use crate::core::limits::{VALBLK_SIZE, VALBLK_SLOTS, VALBLK_SLOT_SIZE};
use crate::core::types::{PeerIdentity, Pid, StreamId};
use bitflags::bitflags;
use bytes::{Buf, BufMut};

const STREAM_ID_SHIFT: u32 = 16;

bitflags! {
    /// Negotiation messages carried in a slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u32 {
        /// Owner has given up; no further negotiation with it
        const SHUTDOWN = 1 << 0;
        /// Owner proposes the stream named by its stream id
        const CONNECT_REQUEST = 1 << 1;
        /// Direction of the proposal: set when the owner will write
        const WILL_WRITE = 1 << 2;
        /// Owner is parked and wants a wake after the next change
        const WAKE_REQUEST = 1 << 3;
        /// Set by the other peer: proposal accepted
        const PEER_ACK = 1 << 4;
        /// Set by the other peer: proposal refused
        const PEER_NAK = 1 << 5;
    }
}

/// One peer's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub pid: Pid,
    pub instance: u32,
    pub flags: SlotFlags,
    pub stream_id: StreamId,
}

impl Slot {
    pub fn claimed_by(identity: PeerIdentity) -> Self {
        Self {
            pid: identity.pid,
            instance: identity.instance,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pid == 0
    }

    #[inline]
    pub fn owned_by(&self, identity: PeerIdentity) -> bool {
        self.pid == identity.pid && self.instance == identity.instance
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.flags.contains(SlotFlags::SHUTDOWN)
    }

    /// A proposal the other peer has not answered yet
    pub fn has_outstanding_request(&self) -> bool {
        self.flags.contains(SlotFlags::CONNECT_REQUEST)
            && !self.flags.intersects(SlotFlags::PEER_ACK | SlotFlags::PEER_NAK)
    }

    fn put(&self, out: &mut impl BufMut) {
        out.put_u32_le(self.pid);
        out.put_u32_le(self.instance);
        out.put_u32_le(self.flags.bits() | (u32::from(self.stream_id) << STREAM_ID_SHIFT));
        out.put_u32_le(0);
    }

    fn get(input: &mut impl Buf) -> Self {
        let pid = input.get_u32_le();
        let instance = input.get_u32_le();
        let word = input.get_u32_le();
        input.advance(4);
        Self {
            pid,
            instance,
            flags: SlotFlags::from_bits_truncate(word & 0xFFFF),
            stream_id: (word >> STREAM_ID_SHIFT) as StreamId,
        }
    }
}

/// Decoded value block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueBlock {
    pub slots: [Slot; VALBLK_SLOTS],
}

impl ValueBlock {
    pub fn encode(&self) -> [u8; VALBLK_SIZE] {
        let mut raw = [0u8; VALBLK_SIZE];
        let mut out = &mut raw[..];
        for slot in &self.slots {
            slot.put(&mut out);
        }
        raw
    }

    pub fn decode(raw: &[u8; VALBLK_SIZE]) -> Self {
        let mut input = &raw[..];
        let mut block = Self::default();
        for slot in block.slots.iter_mut() {
            *slot = Slot::get(&mut input);
        }
        debug_assert_eq!(input.len(), 0);
        block
    }

    /// Index of the other slot
    #[inline]
    pub fn other(index: usize) -> usize {
        (index + 1) % VALBLK_SLOTS
    }
}

const _: () = assert!(VALBLK_SLOT_SIZE * VALBLK_SLOTS == VALBLK_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explicit_byte_layout() {
        let mut block = ValueBlock::default();
        block.slots[1] = Slot {
            pid: 0x0102_0304,
            instance: 0xAABB_CCDD,
            flags: SlotFlags::CONNECT_REQUEST | SlotFlags::WILL_WRITE,
            stream_id: 3,
        };
        let raw = block.encode();

        assert_eq!(&raw[..16], &[0u8; 16]);
        assert_eq!(&raw[16..20], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[20..24], &[0xDD, 0xCC, 0xBB, 0xAA]);
        // flags 0b110 with stream id 3 in the high half
        assert_eq!(&raw[24..28], &[0x06, 0x00, 0x03, 0x00]);
        assert_eq!(&raw[28..32], &[0u8; 4]);

        assert_eq!(ValueBlock::decode(&raw), block);
    }

    #[test]
    fn test_unknown_flag_bits_are_dropped() {
        let mut raw = [0u8; VALBLK_SIZE];
        raw[8] = 0xC1; // shutdown plus two undefined bits
        let block = ValueBlock::decode(&raw);
        assert_eq!(block.slots[0].flags, SlotFlags::SHUTDOWN);
    }

    #[test]
    fn test_outstanding_request() {
        let mut slot = Slot::default();
        assert!(!slot.has_outstanding_request());
        slot.flags = SlotFlags::CONNECT_REQUEST;
        assert!(slot.has_outstanding_request());
        slot.flags |= SlotFlags::PEER_ACK;
        assert!(!slot.has_outstanding_request());
    }

    #[test]
    fn test_other_slot() {
        assert_eq!(ValueBlock::other(0), 1);
        assert_eq!(ValueBlock::other(1), 0);
    }
}
