// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Variable-length record length prefix.
//!
//! Layout, least significant bits first:
//!
//! ```text
//!  byte 0: [c][bits 0..7  ]     c = another byte follows
//!  byte 1: [c][bits 7..14 ]
//!  byte 2:    [bits 14..22]     only present together with byte 3
//!  byte 3:    [bits 22..30]
//! ```
//!
//! A prefix is therefore 1, 2 or 4 bytes long and lengths up to `2^30 - 1`
//! can be represented. Three byte prefixes never occur.

use crate::errors::CodecError;

/// Largest record length that fits the prefix.
pub const MAX_ENCODABLE_LENGTH: usize = (1 << 30) - 1;

/// Longest prefix the codec produces.
pub const MAX_PREFIX_LEN: usize = 4;

const CONTINUATION: u8 = 0x80;
const SEVEN_BITS: usize = 0x7f;

/// An encoded length prefix, stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefix {
    bytes: [u8; MAX_PREFIX_LEN],
    len: usize,
}

impl LengthPrefix {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Encodes `length` into its prefix.
///
/// # Errors
///
/// Returns [`CodecError::LengthOverflow`] if `length` needs more than 30 bits.
/// The length is never truncated.
pub fn encode_length(length: usize) -> Result<LengthPrefix, CodecError> {
    if length > MAX_ENCODABLE_LENGTH {
        return Err(CodecError::LengthOverflow(length));
    }

    let mut bytes = [0u8; MAX_PREFIX_LEN];
    #[allow(clippy::cast_possible_truncation)]
    {
        bytes[0] = (length & SEVEN_BITS) as u8;
        if length >> 7 == 0 {
            return Ok(LengthPrefix { bytes, len: 1 });
        }
        bytes[0] |= CONTINUATION;

        bytes[1] = ((length >> 7) & SEVEN_BITS) as u8;
        if length >> 14 == 0 {
            return Ok(LengthPrefix { bytes, len: 2 });
        }
        bytes[1] |= CONTINUATION;

        bytes[2] = (length >> 14) as u8;
        bytes[3] = (length >> 22) as u8;
    }
    Ok(LengthPrefix {
        bytes,
        len: MAX_PREFIX_LEN,
    })
}

/// Decodes a prefix, pulling bytes from `next_byte` one at a time.
///
/// Returns the decoded length and the number of bytes consumed. The caller
/// guarantees that a complete prefix is available.
pub fn decode_length<F>(mut next_byte: F) -> (usize, usize)
where
    F: FnMut() -> u8,
{
    let first = next_byte();
    let mut length = usize::from(first) & SEVEN_BITS;
    if first & CONTINUATION == 0 {
        return (length, 1);
    }

    let second = next_byte();
    length |= (usize::from(second) & SEVEN_BITS) << 7;
    if second & CONTINUATION == 0 {
        return (length, 2);
    }

    length |= usize::from(next_byte()) << 14;
    length |= usize::from(next_byte()) << 22;
    (length, MAX_PREFIX_LEN)
}
