//! Sequence codec
//!
//! Every probe datagram starts with the packet's sequence number as a
//! big-endian `u32`; the remaining bytes are padding. The driver recovers
//! the same field from the UDP payload and reports its low 16 bits.

use crate::error::{ProbeError, Result};
use nic_ts_common::constants::{SEQ_FIELD_LEN, SEQ_FIELD_OFFSET};

/// Default datagram size
pub const DEFAULT_PAYLOAD_SIZE: usize = 256;

/// Encode a sequence number into its wire prefix
pub fn encode(sequence: u32) -> [u8; SEQ_FIELD_LEN] {
    sequence.to_be_bytes()
}

/// Write a sequence number into an existing payload
pub fn encode_into(sequence: u32, payload: &mut [u8]) -> Result<()> {
    let field = field_mut(payload)?;
    field.copy_from_slice(&encode(sequence));
    Ok(())
}

/// Read the sequence number back out of a payload
pub fn decode(payload: &[u8]) -> Result<u32> {
    let end = SEQ_FIELD_OFFSET + SEQ_FIELD_LEN;
    let field = payload.get(SEQ_FIELD_OFFSET..end).ok_or(ProbeError::MalformedPacket {
        len: payload.len(),
        needed: end,
    })?;

    let mut bytes = [0u8; SEQ_FIELD_LEN];
    bytes.copy_from_slice(field);
    Ok(u32::from_be_bytes(bytes))
}

/// Build a zero-padded datagram of `size` bytes carrying `sequence`
///
/// Sizes smaller than the sequence field are rounded up to it.
pub fn build_payload(sequence: u32, size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size.max(SEQ_FIELD_OFFSET + SEQ_FIELD_LEN)];
    payload[SEQ_FIELD_OFFSET..SEQ_FIELD_OFFSET + SEQ_FIELD_LEN].copy_from_slice(&encode(sequence));
    payload
}

/// Narrow a wire sequence to the 16-bit space the driver reports
pub fn wire_key(sequence: u32) -> u16 {
    (sequence & 0xFFFF) as u16
}

fn field_mut(payload: &mut [u8]) -> Result<&mut [u8]> {
    let len = payload.len();
    let end = SEQ_FIELD_OFFSET + SEQ_FIELD_LEN;
    payload
        .get_mut(SEQ_FIELD_OFFSET..end)
        .ok_or(ProbeError::MalformedPacket { len, needed: end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_network_byte_order() {
        assert_eq!(encode(1), [0, 0, 0, 1]);
        assert_eq!(encode(0x0102_0304), [1, 2, 3, 4]);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let err = decode(&[0, 1, 2]).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::MalformedPacket { len: 3, needed: 4 }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_build_payload_pads() {
        let payload = build_payload(7, DEFAULT_PAYLOAD_SIZE);
        assert_eq!(payload.len(), DEFAULT_PAYLOAD_SIZE);
        assert_eq!(decode(&payload).unwrap(), 7);
        assert!(payload[SEQ_FIELD_LEN..].iter().all(|&b| b == 0));

        assert_eq!(build_payload(9, 1).len(), SEQ_FIELD_LEN);
    }

    #[test]
    fn test_encode_into_rewrites_prefix_only() {
        let mut payload = vec![0xAA; 8];
        encode_into(5, &mut payload).unwrap();
        assert_eq!(payload, [0, 0, 0, 5, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert!(encode_into(5, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_wire_key_wraps() {
        assert_eq!(wire_key(1), 1);
        assert_eq!(wire_key(65_535), 65_535);
        assert_eq!(wire_key(65_536), 0);
        assert_eq!(wire_key(u32::MAX), 65_535);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(sequence in any::<u32>(), padding in 0usize..64) {
            let payload = build_payload(sequence, SEQ_FIELD_LEN + padding);
            prop_assert_eq!(decode(&payload).unwrap(), sequence);
            prop_assert_eq!(decode(&encode(sequence)).unwrap(), sequence);
        }
    }
}
