//! Token-level encoding for the Breezart TCP protocol.
//!
//! Requests and responses are ASCII lines of `_`-separated tokens. Numbers
//! travel as unpadded lowercase hex, status words pack several fields into
//! bit ranges of a 16-bit value.

use crate::error::{AppError, Result};

pub const DELIMITER: char = '_';

/// Sensor channels report this value when they have nothing to say.
pub const NO_DATA: u32 = 0xFB07;

/// Error tags the device can answer with, and what they mean.
pub const ERROR_TAGS: [(&str, &str); 5] = [
    ("VEPas", "Wrong password"),
    ("VEFrm", "Wrong format of request"),
    ("VECd1", "Request of type 1 not found"),
    ("VECd2", "Request of type 2 not found"),
    ("VEDat", "Error in request data"),
];

const WORD_BITS: u8 = 16;

pub fn encode_hex(value: i64) -> Result<String> {
    if !(0..=0xFFFF).contains(&value) {
        return Err(AppError::Range(value));
    }
    Ok(format!("{:x}", value))
}

pub fn decode_hex_unsigned(token: &str) -> Result<u32> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::InvalidHex(token.to_string()));
    }
    u32::from_str_radix(token, 16).map_err(|_| AppError::InvalidHex(token.to_string()))
}

/// A token that must fit one 16-bit protocol word.
fn decode_word(token: &str) -> Result<u16> {
    u16::try_from(decode_hex_unsigned(token)?).map_err(|_| AppError::InvalidHex(token.to_string()))
}

/// Two's-complement view of a 16-bit word.
pub fn decode_hex_signed16(token: &str) -> Result<i32> {
    Ok(i32::from(decode_word(token)? as i16))
}

/// Inclusive bit range `from_bit..=to_bit` of a hex word, bit 0 being the
/// least significant.
pub fn extract_bits(word: &str, from_bit: u8, to_bit: u8) -> Result<u16> {
    if from_bit > to_bit || to_bit >= WORD_BITS {
        return Err(AppError::Protocol(format!(
            "invalid bit range {}..={}",
            from_bit, to_bit
        )));
    }
    if word == "0" {
        return Ok(0);
    }
    let value = u32::from(decode_word(word)?);
    let width = u32::from(to_bit - from_bit) + 1;
    let mask = (1u32 << width) - 1;
    Ok(((value >> from_bit) & mask) as u16)
}

pub fn bit(word: &str, index: u8) -> Result<bool> {
    Ok(extract_bits(word, index, index)? == 1)
}

pub fn tokenize(line: &str) -> Vec<String> {
    line.split(DELIMITER)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fails with [`AppError::Device`] when the response leads with one of the
/// known error tags, otherwise hands the tokens back untouched.
pub fn classify_errors(tokens: Vec<String>) -> Result<Vec<String>> {
    let Some(first) = tokens.first() else {
        return Ok(tokens);
    };
    match ERROR_TAGS.iter().find(|(tag, _)| *tag == first.as_str()) {
        Some(&(tag, reason)) => Err(AppError::Device {
            code: tag.to_string(),
            reason,
            tokens,
        }),
        None => Ok(tokens),
    }
}

/// `<type>_<password hex>[_<data hex>]`, no terminator.
pub fn build_request(kind: &str, password: u16, data: Option<i64>) -> Result<String> {
    let mut parts = vec![kind.to_string(), encode_hex(i64::from(password))?];
    if let Some(d) = data {
        parts.push(encode_hex(d)?);
    }
    Ok(parts.join(&DELIMITER.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hex_roundtrip_full_domain() {
        for x in 0..=0xFFFFi64 {
            let encoded = encode_hex(x).unwrap();
            assert_eq!(i64::from(decode_hex_unsigned(&encoded).unwrap()), x);
        }
    }

    #[test]
    fn test_encode_hex_is_lowercase_unpadded() {
        assert_eq!(encode_hex(0).unwrap(), "0");
        assert_eq!(encode_hex(0x0a).unwrap(), "a");
        assert_eq!(encode_hex(21579).unwrap(), "544b");
        assert_eq!(encode_hex(0xFFFF).unwrap(), "ffff");
    }

    #[test]
    fn test_encode_hex_rejects_out_of_domain() {
        assert!(matches!(encode_hex(-1), Err(AppError::Range(-1))));
        assert!(matches!(encode_hex(65536), Err(AppError::Range(65536))));
    }

    #[test]
    fn test_decode_signed16() {
        assert_eq!(decode_hex_signed16("ffff").unwrap(), -1);
        assert_eq!(decode_hex_signed16("8000").unwrap(), -32768);
        assert_eq!(decode_hex_signed16("7fff").unwrap(), 32767);
        assert_eq!(decode_hex_signed16("0").unwrap(), 0);
        assert_eq!(decode_hex_signed16("ff38").unwrap(), -200);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_hex_unsigned(""), Err(AppError::InvalidHex(_))));
        assert!(matches!(decode_hex_unsigned("+1"), Err(AppError::InvalidHex(_))));
        assert!(matches!(decode_hex_unsigned("zz"), Err(AppError::InvalidHex(_))));
        assert!(matches!(decode_hex_signed16("10000"), Err(AppError::InvalidHex(_))));
    }

    #[test]
    fn test_extract_bits_table() {
        // (word, from, to, expected) checked against a manual decomposition
        let cases: &[(&str, u8, u8, u16)] = &[
            ("1e0f", 0, 7, 0x0f),
            ("1e0f", 8, 15, 0x1e),
            ("a5", 0, 3, 0x5),
            ("a5", 4, 7, 0xa),
            ("1c1", 0, 0, 1),
            ("1c1", 1, 5, 0),
            ("1c1", 6, 8, 0b111),
            ("8000", 15, 15, 1),
            ("8000", 0, 14, 0),
            ("ffff", 0, 15, 0xFFFF),
            ("6000", 13, 13, 1),
            ("6000", 14, 14, 1),
            ("2a", 3, 5, 0b101),
        ];
        for (word, from, to, expected) in cases {
            assert_eq!(
                extract_bits(word, *from, *to).unwrap(),
                *expected,
                "word {} bits {}..={}",
                word,
                from,
                to
            );
        }
    }

    #[test]
    fn test_extract_bits_zero_token_short_circuits() {
        for from in 0..16u8 {
            for to in from..16u8 {
                assert_eq!(extract_bits("0", from, to).unwrap(), 0);
            }
        }
    }

    #[test]
    fn test_extract_bits_rejects_bad_range() {
        assert!(extract_bits("ff", 5, 4).is_err());
        assert!(extract_bits("ff", 0, 16).is_err());
    }

    #[test]
    fn test_extract_bits_rejects_wide_word() {
        assert!(matches!(extract_bits("1ffff", 0, 7), Err(AppError::InvalidHex(ref t)) if t == "1ffff"));
        assert!(matches!(bit("10000", 0), Err(AppError::InvalidHex(_))));
        assert_eq!(extract_bits("0ffff", 8, 15).unwrap(), 0xff);
    }

    #[test]
    fn test_bit() {
        assert!(bit("21", 0).unwrap());
        assert!(!bit("21", 1).unwrap());
        assert!(bit("21", 5).unwrap());
    }

    #[test]
    fn test_tokenize_drops_empty_segments() {
        assert_eq!(tokenize("VSt07__1a_2b"), vec!["VSt07", "1a", "2b"]);
        assert_eq!(tokenize("_OK_"), vec!["OK"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_classify_errors_matches_every_tag() {
        for (tag, reason) in ERROR_TAGS {
            let tokens = tokenize(&format!("{}_12", tag));
            match classify_errors(tokens) {
                Err(AppError::Device {
                    code,
                    reason: r,
                    tokens,
                }) => {
                    assert_eq!(code, tag);
                    assert_eq!(r, reason);
                    assert_eq!(tokens, vec![tag.to_string(), "12".to_string()]);
                }
                other => panic!("expected device error for {}, got {:?}", tag, other),
            }
        }
    }

    #[test]
    fn test_classify_errors_passes_through() {
        let tokens = tokenize("VSt07_1_2");
        assert_eq!(classify_errors(tokens.clone()).unwrap(), tokens);
        assert!(classify_errors(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_build_request() {
        assert_eq!(build_request("VSt07", 21579, None).unwrap(), "VSt07_544b");
        assert_eq!(build_request("VWTmp", 21579, Some(22)).unwrap(), "VWTmp_544b_16");
        assert!(build_request("VWTmp", 1, Some(-3)).is_err());
    }
}
