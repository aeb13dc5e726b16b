//! FlightVars wire codec.
//!
//! Frame layout, big-endian throughout:
//! - TYPE (2 bytes): `MessageType` discriminant + 0x700
//! - PAYLOAD: type-specific fields. Strings are a 2-byte length followed by
//!   UTF-8 bytes; values are a 1-byte type code followed by the payload.
//! - TERMINATOR (2 bytes): 0x0D0A

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{Message, MessageType, SubscriptionStatus, VariableValue};

pub const TERMINATION_MARK: u16 = 0x0D0A;

/// Largest frame produced by a message without string fields
/// (`VarUpdate` carrying a float).
pub const MAX_FIXED_FRAME_SIZE: usize = 2 + 4 + 1 + 8 + 2;

pub fn encode<W: Write>(msg: &Message, w: &mut W) -> Result<(), CodecError> {
    write_u16(w, msg.message_type().code())?;
    match msg {
        Message::BeginSession { peer_name, protocol_version } => {
            write_str(w, peer_name)?;
            write_u16(w, *protocol_version)?;
        }
        Message::EndSession { cause } => {
            write_str(w, cause)?;
        }
        Message::SubscriptionRequest { var_group, var_name } => {
            write_str(w, var_group)?;
            write_str(w, var_name)?;
        }
        Message::SubscriptionReply { status, var_group, var_name, subscription_id, cause } => {
            write_u8(w, status.code())?;
            write_str(w, var_group)?;
            write_str(w, var_name)?;
            write_u32(w, *subscription_id)?;
            write_str(w, cause)?;
        }
        Message::UnsubscriptionRequest { subscription_id } => {
            write_u32(w, *subscription_id)?;
        }
        Message::UnsubscriptionReply { status, subscription_id, cause } => {
            write_u8(w, status.code())?;
            write_u32(w, *subscription_id)?;
            write_str(w, cause)?;
        }
        Message::VarUpdate { subscription_id, value } => {
            write_u32(w, *subscription_id)?;
            write_value(w, value)?;
        }
    }
    write_u16(w, TERMINATION_MARK)?;
    Ok(())
}

pub fn decode<R: Read>(r: &mut R) -> Result<Message, CodecError> {
    let code = read_u16(r)?;
    let msg_type = MessageType::from_code(code).ok_or(CodecError::InvalidMessageType(code))?;
    let msg = match msg_type {
        MessageType::BeginSession => Message::BeginSession {
            peer_name: read_str(r)?,
            protocol_version: read_u16(r)?,
        },
        MessageType::EndSession => Message::EndSession { cause: read_str(r)? },
        MessageType::SubscriptionRequest => Message::SubscriptionRequest {
            var_group: read_str(r)?,
            var_name: read_str(r)?,
        },
        MessageType::SubscriptionReply => Message::SubscriptionReply {
            status: SubscriptionStatus::from_code(read_u8(r)?),
            var_group: read_str(r)?,
            var_name: read_str(r)?,
            subscription_id: read_u32(r)?,
            cause: read_str(r)?,
        },
        MessageType::UnsubscriptionRequest => Message::UnsubscriptionRequest {
            subscription_id: read_u32(r)?,
        },
        MessageType::UnsubscriptionReply => Message::UnsubscriptionReply {
            status: SubscriptionStatus::from_code(read_u8(r)?),
            subscription_id: read_u32(r)?,
            cause: read_str(r)?,
        },
        MessageType::VarUpdate => Message::VarUpdate {
            subscription_id: read_u32(r)?,
            value: read_value(r)?,
        },
    };
    let mark = read_u16(r)?;
    if mark != TERMINATION_MARK {
        return Err(CodecError::InvalidTerminationMark(mark));
    }
    Ok(msg)
}

pub fn encode_to_bytes(msg: &Message) -> Result<Bytes, CodecError> {
    let mut w = BytesMut::with_capacity(64).writer();
    encode(msg, &mut w)?;
    Ok(w.into_inner().freeze())
}

pub fn decode_from_slice(mut bytes: &[u8]) -> Result<Message, CodecError> {
    decode(&mut bytes)
}

fn write_value<W: Write>(w: &mut W, value: &VariableValue) -> Result<(), CodecError> {
    write_u8(w, value.type_code())?;
    match *value {
        VariableValue::Boolean(v) => write_u8(w, v as u8),
        VariableValue::Byte(v) => write_u8(w, v),
        VariableValue::Word(v) => write_u16(w, v),
        VariableValue::Dword(v) => write_u32(w, v),
        VariableValue::Float(v) => {
            let (nsig, exp) = encode_float(v);
            write_u32(w, nsig)?;
            write_u32(w, exp)
        }
    }
}

fn read_value<R: Read>(r: &mut R) -> Result<VariableValue, CodecError> {
    let code = read_u8(r)?;
    Ok(match code {
        0 => VariableValue::Boolean(read_u8(r)? != 0),
        1 => VariableValue::Byte(read_u8(r)?),
        2 => VariableValue::Word(read_u16(r)?),
        3 => VariableValue::Dword(read_u32(r)?),
        4 => {
            let nsig = read_u32(r)?;
            let exp = read_u32(r)?;
            VariableValue::Float(decode_float(nsig, exp))
        }
        other => return Err(CodecError::InvalidVariableType(other)),
    })
}

/// Splits `value` into the wire pair `(nsig, exponent)`.
///
/// `nsig = 2 * round((s - 0.5) * u32::MAX)` where `s` is the frexp
/// significand in `[0.5, 1.0)`. The scheme only covers positive finite
/// values; anything outside the `u32` range saturates.
pub fn encode_float(value: f64) -> (u32, u32) {
    let (sig, exp) = frexp(value);
    let nsig = 2.0 * ((sig - 0.5) * u32::MAX as f64).round();
    (nsig as u32, exp as u32)
}

/// True when `value` survives [`encode_float`]: positive and finite.
pub fn is_representable_float(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

pub fn decode_float(nsig: u32, exp: u32) -> f64 {
    let sig = nsig as f64 * 0.5 / u32::MAX as f64 + 0.5;
    ldexp(sig, exp as i32)
}

fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // subnormal: scale into the normal range first
        let (sig, exp) = frexp(x * 2f64.powi(64));
        return (sig, exp - 64);
    }
    let sig = f64::from_bits((bits & !(0x7ff << 52)) | (1022 << 52));
    (sig, biased - 1022)
}

fn ldexp(sig: f64, exp: i32) -> f64 {
    // two steps so 2^exp itself never overflows or flushes to zero
    let half = exp / 2;
    sig * 2f64.powi(half) * 2f64.powi(exp - half)
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<(), CodecError> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> Result<(), CodecError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<(), CodecError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::StringTooLong(s.len()))?;
    write_u16(w, len)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, CodecError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, CodecError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CodecError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_str<R: Read>(r: &mut R) -> Result<String, CodecError> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{FixedBuffer, RingBuffer};
    use proptest::prelude::*;

    fn roundtrip(msg: &Message) -> Message {
        let bytes = encode_to_bytes(msg).unwrap();
        decode_from_slice(&bytes).unwrap()
    }

    #[test]
    fn begin_session_layout() {
        let msg = Message::BeginSession { peer_name: "ab".into(), protocol_version: 0x0102 };
        let bytes = encode_to_bytes(&msg).unwrap();
        assert_eq!(&bytes[..], &[0x07, 0x00, 0x00, 0x02, b'a', b'b', 0x01, 0x02, 0x0d, 0x0a]);
    }

    #[test]
    fn var_update_word_layout() {
        let msg = Message::VarUpdate { subscription_id: 42, value: VariableValue::Word(1200) };
        let bytes = encode_to_bytes(&msg).unwrap();
        assert_eq!(
            &bytes[..],
            &[0x07, 0x06, 0, 0, 0, 42, 2, 0x04, 0xb0, 0x0d, 0x0a]
        );
    }

    #[test]
    fn float_frame_is_the_largest_fixed_frame() {
        let msg = Message::VarUpdate { subscription_id: 1, value: VariableValue::Float(1.0) };
        assert_eq!(encode_to_bytes(&msg).unwrap().len(), MAX_FIXED_FRAME_SIZE);
    }

    #[test]
    fn float_encoding_is_deterministic() {
        assert_eq!(encode_float(3.1415), encode_float(3.1415));
        assert_eq!(encode_float(1.0), (0, 1));
        assert_eq!(encode_float(0.75), (2 * 1_073_741_824, 0));
    }

    #[test]
    fn float_roundtrip_within_scheme_precision() {
        for v in [3.1415f64, 1.0, 0.001, 123456.789, 1e-300, 1e300, 0.5, 0.999_999] {
            let (nsig, exp) = encode_float(v);
            let back = decode_float(nsig, exp);
            assert!(((back - v) / v).abs() < 1e-6, "{} -> {}", v, back);
        }
    }

    #[test]
    fn only_positive_finite_floats_are_representable() {
        for v in [3.1415, f64::MIN_POSITIVE / 8.0, 1e300] {
            assert!(is_representable_float(v), "{}", v);
        }
        for v in [0.0, -0.0, -2.0, -0.001, f64::NAN, f64::INFINITY] {
            assert!(!is_representable_float(v), "{}", v);
        }
    }

    #[test]
    fn float_frexp_handles_subnormals() {
        let v = f64::MIN_POSITIVE / 8.0;
        let (nsig, exp) = encode_float(v);
        assert!(((decode_float(nsig, exp) - v) / v).abs() < 1e-6);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let err = decode_from_slice(&[0x07, 0x07, 0x0d, 0x0a]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessageType(0x707)));
        assert!(err.is_protocol());
    }

    #[test]
    fn rejects_unknown_variable_type() {
        let err = decode_from_slice(&[0x07, 0x06, 0, 0, 0, 1, 9, 0, 0x0d, 0x0a]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidVariableType(9)));
    }

    #[test]
    fn rejects_bad_termination_mark() {
        let err = decode_from_slice(&[0x07, 0x04, 0, 0, 0, 1, 0x0a, 0x0d]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidTerminationMark(0x0a0d)));
    }

    #[test]
    fn truncated_input_is_incomplete_not_protocol() {
        let bytes = encode_to_bytes(&Message::EndSession { cause: "bye".into() }).unwrap();
        for cut in 0..bytes.len() {
            let err = decode_from_slice(&bytes[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "cut at {}: {}", cut, err);
            assert!(!err.is_protocol());
        }
    }

    #[test]
    fn oversized_string_is_refused() {
        let msg = Message::EndSession { cause: "x".repeat(70_000) };
        assert!(matches!(encode_to_bytes(&msg), Err(CodecError::StringTooLong(70_000))));
    }

    #[test]
    fn decodes_split_message_through_ring_mark() {
        let msg = Message::subscription_reply(
            SubscriptionStatus::Subscribed,
            &"fsuipc/offset->0x200".parse().unwrap(),
            42,
            "",
        );
        let bytes = encode_to_bytes(&msg).unwrap();
        let (head, tail) = bytes.split_at(7);

        let mut ring = RingBuffer::new(64);
        ring.write(head);
        ring.set_mark();
        let err = decode(&mut ring).unwrap_err();
        assert!(err.is_incomplete());
        ring.reset();
        assert_eq!(ring.available_for_read(), head.len());

        ring.write(tail);
        ring.set_mark();
        assert_eq!(decode(&mut ring).unwrap(), msg);
        ring.unset_mark();
        assert!(ring.is_empty());
    }

    #[test]
    fn encode_into_fixed_buffer_fails_when_too_small() {
        let mut buf = FixedBuffer::new(8);
        let err = encode(&Message::EndSession { cause: "a long goodbye".into() }, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    fn value() -> impl Strategy<Value = VariableValue> {
        prop_oneof![
            any::<bool>().prop_map(VariableValue::Boolean),
            any::<u8>().prop_map(VariableValue::Byte),
            any::<u16>().prop_map(VariableValue::Word),
            any::<u32>().prop_map(VariableValue::Dword),
        ]
    }

    fn status() -> impl Strategy<Value = SubscriptionStatus> {
        (0u8..6).prop_map(SubscriptionStatus::from_code)
    }

    fn message() -> impl Strategy<Value = Message> {
        let s = || "[a-z0-9/:>_ -]{0,24}";
        prop_oneof![
            (s(), any::<u16>()).prop_map(|(peer_name, protocol_version)| Message::BeginSession { peer_name, protocol_version }),
            s().prop_map(|cause| Message::EndSession { cause }),
            (s(), s()).prop_map(|(var_group, var_name)| Message::SubscriptionRequest { var_group, var_name }),
            (status(), s(), s(), any::<u32>(), s()).prop_map(|(status, var_group, var_name, subscription_id, cause)| {
                Message::SubscriptionReply { status, var_group, var_name, subscription_id, cause }
            }),
            any::<u32>().prop_map(|subscription_id| Message::UnsubscriptionRequest { subscription_id }),
            (status(), any::<u32>(), s()).prop_map(|(status, subscription_id, cause)| {
                Message::UnsubscriptionReply { status, subscription_id, cause }
            }),
            (any::<u32>(), value()).prop_map(|(subscription_id, value)| Message::VarUpdate { subscription_id, value }),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(msg in message()) {
            prop_assert_eq!(roundtrip(&msg), msg);
        }

        #[test]
        fn float_roundtrip_positive(v in 1e-200f64..1e200) {
            let msg = Message::VarUpdate { subscription_id: 7, value: VariableValue::Float(v) };
            match roundtrip(&msg) {
                Message::VarUpdate { value: VariableValue::Float(back), .. } => {
                    prop_assert!(((back - v) / v).abs() < 1e-6);
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
