//! # Wire Codec — Framing, Fragmentation, Reassembly
//!
//! Deterministic binary encoding of [`WireMessage`] envelopes, plus the
//! fragmentation machinery that squeezes arbitrarily large logical
//! messages through a link whose single-write budget is a few hundred
//! bytes.
//!
//! ## Fragmentation model
//!
//! ```text
//! logical message (encrypted + signed)
//!   │ serialize
//!   ▼
//! [ envelope ............ payload (N bytes) ]          fits MTU? send as-is
//!   │ otherwise: split the *payload*, clone the envelope
//!   ▼
//! [ env │ id#0 │ seq 0 │ chunk ]   ≤ MTU
//! [ env │ id#1 │ seq 1 │ chunk ]   ≤ MTU
//! [ env │ id#2 │ seq 2 │ chunk ]   ≤ MTU
//! ```
//!
//! The budget check is done against the **full fragment envelope**, not
//! just the payload: a 64-byte signature and two 44-character device ids
//! ride along on every fragment, and an accounting scheme that forgets
//! them produces fragments that blow the MTU on the wire. Chunk capacity
//! is therefore `budget − serialized_size(envelope with empty payload)`,
//! measured with the widest possible fragment suffix so no index ever
//! tips a fragment over the line.
//!
//! Fragments carry the signature of the whole logical message; the
//! receiver reassembles first and verifies once.

use crate::config;

use super::error::WireError;
use super::message::WireMessage;

/// Encode an envelope to wire bytes.
///
/// bincode with its default fixed-width integer encoding: deterministic,
/// compact enough, and the leading two bytes are always the version field.
pub fn serialize(message: &WireMessage) -> Result<Vec<u8>, WireError> {
    bincode::serialize(message).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Decode wire bytes into an envelope.
///
/// The version is checked before anything else: `version` is the first
/// envelope field and bincode encodes `u16` as two fixed little-endian
/// bytes, so peeking at the frame prefix is enough to refuse a frame from
/// a different protocol generation without decoding the rest.
pub fn deserialize(bytes: &[u8]) -> Result<WireMessage, WireError> {
    if bytes.len() < 2 {
        return Err(WireError::Malformed("frame shorter than version prefix".into()));
    }
    let got = u16::from_le_bytes([bytes[0], bytes[1]]);
    if got != config::WIRE_PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            got,
            expected: config::WIRE_PROTOCOL_VERSION,
        });
    }

    bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Split a message into MTU-sized fragments.
///
/// If the serialized message already fits in `max_fragment_bytes`, it is
/// returned unchanged as a single-element vector. Otherwise the payload is
/// split into ordered chunks, each wrapped in a clone of the envelope with
/// the id suffixed by the fragment index.
///
/// # Errors
///
/// [`WireError::Oversized`] when the envelope overhead alone exceeds the
/// budget — no payload could ever fit, and a larger MTU is the only fix.
pub fn fragment(
    message: &WireMessage,
    max_fragment_bytes: usize,
) -> Result<Vec<WireMessage>, WireError> {
    let encoded = serialize(message)?;
    if encoded.len() <= max_fragment_bytes {
        return Ok(vec![message.clone()]);
    }

    // Measure the envelope overhead with the widest values any fragment
    // could carry: the suffix `#4294967295` is as long as an index gets,
    // and sequence/total are already fixed-width. Whatever budget is left
    // is real payload capacity on every fragment.
    let mut probe = message.clone();
    probe.id = format!("{}#{}", message.id, u32::MAX);
    probe.sequence = u32::MAX;
    probe.total_fragments = u32::MAX;
    probe.payload = Vec::new();
    let overhead = serialize(&probe)?.len();

    if overhead >= max_fragment_bytes {
        return Err(WireError::Oversized {
            mtu: max_fragment_bytes,
        });
    }
    let capacity = max_fragment_bytes - overhead;

    let total = message.payload.len().div_ceil(capacity) as u32;
    let mut fragments = Vec::with_capacity(total as usize);
    for (index, chunk) in message.payload.chunks(capacity).enumerate() {
        let mut frag = message.clone();
        frag.id = format!("{}#{}", message.id, index);
        frag.sequence = index as u32;
        frag.total_fragments = total;
        frag.payload = chunk.to_vec();
        fragments.push(frag);
    }
    Ok(fragments)
}

/// Reassemble a complete fragment set into the original logical message.
///
/// The fragments may arrive in any order; they are sorted by sequence
/// number here. The set must be complete and contiguous.
///
/// # Errors
///
/// - [`WireError::MissingFragments`] — fewer (or more) fragments than the
///   envelope declares.
/// - [`WireError::OutOfOrder`] — duplicate or gapped sequence numbers.
/// - [`WireError::Malformed`] — fragments from different logical messages
///   mixed into one set.
pub fn reassemble(fragments: &[WireMessage]) -> Result<WireMessage, WireError> {
    let Some(first) = fragments.first() else {
        return Err(WireError::Malformed("empty fragment set".into()));
    };

    let expected = first.total_fragments;
    let base_id = first.base_id().to_string();

    for frag in fragments {
        if frag.total_fragments != expected || frag.base_id() != base_id {
            return Err(WireError::Malformed(
                "fragment set mixes different logical messages".into(),
            ));
        }
    }

    if fragments.len() as u32 != expected {
        return Err(WireError::MissingFragments {
            expected,
            got: fragments.len() as u32,
        });
    }

    let mut ordered: Vec<&WireMessage> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.sequence);
    for (index, frag) in ordered.iter().enumerate() {
        if frag.sequence != index as u32 {
            return Err(WireError::OutOfOrder);
        }
    }

    let mut payload = Vec::with_capacity(ordered.iter().map(|f| f.payload.len()).sum());
    for frag in &ordered {
        payload.extend_from_slice(&frag.payload);
    }

    let mut whole = ordered[0].clone();
    whole.id = base_id;
    whole.sequence = 0;
    whole.total_fragments = 1;
    whole.payload = payload;
    Ok(whole)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceId;
    use crate::wire::message::MessageType;

    fn signed_message(payload_len: usize) -> WireMessage {
        let mut msg = WireMessage::new(
            MessageType::PaymentTransaction,
            vec![0xAB; payload_len],
            DeviceId::from_string("4uQeVj5tqViQh7yWWGStvkEG1Zmhx6uasJtWmt5o".into()),
            DeviceId::from_string("8fRkLp2xwToPh3yNVAHQumDM9Wnjy4ibdKcXnu7q".into()),
        );
        msg.signature = vec![0x5A; 64];
        msg
    }

    #[test]
    fn serialize_roundtrip() {
        let msg = signed_message(100);
        let bytes = serialize(&msg).unwrap();
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn version_mismatch_is_detected_before_decoding() {
        let msg = signed_message(10);
        let mut bytes = serialize(&msg).unwrap();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;
        assert!(matches!(
            deserialize(&bytes),
            Err(WireError::VersionMismatch { got: 0xFFFF, .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        // Correct version prefix, garbage body.
        let mut bytes = config::WIRE_PROTOCOL_VERSION.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        assert!(matches!(deserialize(&bytes), Err(WireError::Malformed(_))));
        assert!(matches!(deserialize(&[]), Err(WireError::Malformed(_))));
    }

    #[test]
    fn small_message_is_not_fragmented() {
        let msg = signed_message(64);
        let frags = fragment(&msg, config::DEFAULT_MTU).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0], msg);
    }

    #[test]
    fn large_message_round_trips_through_fragmentation() {
        let msg = signed_message(2000);
        let frags = fragment(&msg, 450).unwrap();
        assert!(frags.len() >= 5);

        // Every fragment must respect the wire budget — envelope included.
        for frag in &frags {
            assert!(serialize(frag).unwrap().len() <= 450);
            assert_eq!(frag.total_fragments, frags.len() as u32);
        }

        let whole = reassemble(&frags).unwrap();
        assert_eq!(whole, msg);
        assert_eq!(whole.payload.len(), 2000);
    }

    #[test]
    fn reassembly_handles_network_reordering() {
        let msg = signed_message(2000);
        let mut frags = fragment(&msg, 450).unwrap();
        // Simulate the radio delivering them in whatever order it likes.
        frags.reverse();
        frags.swap(0, 2);

        let whole = reassemble(&frags).unwrap();
        assert_eq!(whole, msg);
    }

    #[test]
    fn missing_fragment_is_rejected() {
        let msg = signed_message(2000);
        let mut frags = fragment(&msg, 450).unwrap();
        frags.pop();
        assert!(matches!(
            reassemble(&frags),
            Err(WireError::MissingFragments { .. })
        ));
    }

    #[test]
    fn duplicated_fragment_is_rejected() {
        let msg = signed_message(2000);
        let mut frags = fragment(&msg, 450).unwrap();
        let dup = frags[0].clone();
        frags.pop();
        frags.push(dup);
        assert!(matches!(reassemble(&frags), Err(WireError::OutOfOrder)));
    }

    #[test]
    fn mixed_fragment_sets_are_rejected() {
        let a = signed_message(2000);
        let b = signed_message(2000);
        let mut frags = fragment(&a, 450).unwrap();
        frags[1] = fragment(&b, 450).unwrap()[1].clone();
        assert!(matches!(reassemble(&frags), Err(WireError::Malformed(_))));
    }

    #[test]
    fn impossible_budget_is_oversized() {
        let msg = signed_message(2000);
        // 100 bytes can't even hold the envelope.
        assert!(matches!(
            fragment(&msg, 100),
            Err(WireError::Oversized { mtu: 100 })
        ));
    }

    #[test]
    fn fragment_ids_carry_the_index_suffix() {
        let msg = signed_message(2000);
        let frags = fragment(&msg, 450).unwrap();
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.id, format!("{}#{}", msg.id, i));
            assert_eq!(frag.sequence, i as u32);
            assert_eq!(frag.base_id(), msg.id);
        }
    }
}
