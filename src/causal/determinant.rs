//! Determinant variants and their compact encoding.
//!
//! A determinant records one nondeterministic choice made by a task: the
//! order in which a record was taken from competing inputs, a timer firing,
//! an RNG draw, a source read position, or a buffer-size decision. The closed
//! variant set keeps the wire format total: every tag byte maps to exactly
//! one shape.

use integer_encoding::VarInt;

use crate::causal::RecordId;
use crate::error::CausalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Determinant {
    /// The record id chosen when multiple inputs raced.
    Order { record: RecordId },

    /// A processing-time timer firing.
    Timer { timer_id: u64, timestamp: u64 },

    /// A random draw.
    Rng { value: u64 },

    /// A source read position decision.
    Source { offset: u64 },

    /// The number of bytes at which an output buffer was cut.
    Buffer { bytes: u32 },
}

const TAG_ORDER: u8 = 1;
const TAG_TIMER: u8 = 2;
const TAG_RNG: u8 = 3;
const TAG_SOURCE: u8 = 4;
const TAG_BUFFER: u8 = 5;

/// Strategy seam for determinant (de)serialization.
///
/// `decode_next` advances `pos` past one determinant and returns `Ok(None)`
/// exactly at end of stream. Concatenations of encoded streams decode as the
/// concatenation of their determinants.
pub trait DeterminantEncoding: Send + Sync {
    fn encode_to(&self, out: &mut Vec<u8>, determinant: &Determinant);

    fn decode_next(
        &self,
        bytes: &[u8],
        pos: &mut usize,
    ) -> Result<Option<Determinant>, CausalError>;
}

/// Tag byte plus varint payload fields; record ids are raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactDeterminantEncoding;

fn put_varint(out: &mut Vec<u8>, value: u64) {
    let mut scratch = [0u8; 10];
    let n = value.encode_var(&mut scratch);
    out.extend_from_slice(&scratch[..n]);
}

fn take_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, CausalError> {
    let (value, nbytes) =
        u64::decode_var(&bytes[*pos..]).ok_or(CausalError::DeterminantDecode(*pos))?;
    *pos += nbytes;
    Ok(value)
}

impl DeterminantEncoding for CompactDeterminantEncoding {
    fn encode_to(&self, out: &mut Vec<u8>, determinant: &Determinant) {
        match determinant {
            Determinant::Order { record } => {
                out.push(TAG_ORDER);
                out.extend_from_slice(record.as_bytes());
            }
            Determinant::Timer {
                timer_id,
                timestamp,
            } => {
                out.push(TAG_TIMER);
                put_varint(out, *timer_id);
                put_varint(out, *timestamp);
            }
            Determinant::Rng { value } => {
                out.push(TAG_RNG);
                put_varint(out, *value);
            }
            Determinant::Source { offset } => {
                out.push(TAG_SOURCE);
                put_varint(out, *offset);
            }
            Determinant::Buffer { bytes } => {
                out.push(TAG_BUFFER);
                put_varint(out, *bytes as u64);
            }
        }
    }

    fn decode_next(
        &self,
        bytes: &[u8],
        pos: &mut usize,
    ) -> Result<Option<Determinant>, CausalError> {
        if *pos >= bytes.len() {
            return Ok(None);
        }
        let tag_at = *pos;
        let tag = bytes[*pos];
        *pos += 1;
        let determinant = match tag {
            TAG_ORDER => {
                if bytes.len() - *pos < RecordId::NUM_BYTES {
                    return Err(CausalError::DeterminantDecode(*pos));
                }
                let mut id = [0u8; RecordId::NUM_BYTES];
                id.copy_from_slice(&bytes[*pos..*pos + RecordId::NUM_BYTES]);
                *pos += RecordId::NUM_BYTES;
                Determinant::Order {
                    record: RecordId(id),
                }
            }
            TAG_TIMER => Determinant::Timer {
                timer_id: take_varint(bytes, pos)?,
                timestamp: take_varint(bytes, pos)?,
            },
            TAG_RNG => Determinant::Rng {
                value: take_varint(bytes, pos)?,
            },
            TAG_SOURCE => Determinant::Source {
                offset: take_varint(bytes, pos)?,
            },
            TAG_BUFFER => {
                let bytes_cut = take_varint(bytes, pos)?;
                if bytes_cut > u32::MAX as u64 {
                    return Err(CausalError::DeterminantDecode(tag_at));
                }
                Determinant::Buffer {
                    bytes: bytes_cut as u32,
                }
            }
            _ => return Err(CausalError::DeterminantDecode(tag_at)),
        };
        Ok(Some(determinant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Determinant> {
        vec![
            Determinant::Order {
                record: RecordId([1, 2, 3, 4]),
            },
            Determinant::Timer {
                timer_id: 9,
                timestamp: 1_234_567_890,
            },
            Determinant::Rng { value: u64::MAX },
            Determinant::Source { offset: 0 },
            Determinant::Buffer { bytes: 32_768 },
        ]
    }

    #[test]
    fn round_trip_closed_variant_set() {
        let encoding = CompactDeterminantEncoding;
        let mut encoded = Vec::new();
        for d in all_variants() {
            encoding.encode_to(&mut encoded, &d);
        }

        let mut pos = 0;
        let mut decoded = Vec::new();
        while let Some(d) = encoding.decode_next(&encoded, &mut pos).unwrap() {
            decoded.push(d);
        }
        assert_eq!(decoded, all_variants());
        assert_eq!(pos, encoded.len());
    }

    #[test]
    fn empty_stream_decodes_to_none() {
        let encoding = CompactDeterminantEncoding;
        let mut pos = 0;
        assert_eq!(encoding.decode_next(&[], &mut pos).unwrap(), None);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let encoding = CompactDeterminantEncoding;
        let mut pos = 0;
        assert!(matches!(
            encoding.decode_next(&[0xEE], &mut pos),
            Err(CausalError::DeterminantDecode(0))
        ));
    }
}
