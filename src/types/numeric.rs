//! Binary NUMERIC support.
//!
//! NUMERIC travels as packed base-10000 digits; this crate never does
//! arithmetic on it, so values are converted to their canonical decimal text
//! and handed to the text parsers.

use crate::error::{Error, Result};

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

/// Render a binary NUMERIC value as decimal text.
///
/// Layout: ndigits (u16), weight (i16), sign (u16), dscale (u16), then
/// `ndigits` base-10000 digits. `weight` is the power of 10000 of the first
/// digit.
pub(crate) fn to_decimal_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 8 {
        return Err(Error::decode("NUMERIC too short"));
    }

    let ndigits = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let weight = i16::from_be_bytes([bytes[2], bytes[3]]) as isize;
    let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
    let dscale = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

    if bytes.len() != 8 + ndigits * 2 {
        return Err(Error::decode(format!(
            "NUMERIC length {} does not match {} digits",
            bytes.len(),
            ndigits
        )));
    }

    match sign {
        SIGN_NAN => return Ok("NaN".to_string()),
        SIGN_PINF => return Ok("Infinity".to_string()),
        SIGN_NINF => return Ok("-Infinity".to_string()),
        SIGN_POS | SIGN_NEG => {}
        other => return Err(Error::decode(format!("invalid NUMERIC sign 0x{:04x}", other))),
    }

    let digits: Vec<u16> = bytes[8..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    if let Some(bad) = digits.iter().find(|d| **d > 9999) {
        return Err(Error::decode(format!("invalid NUMERIC digit {}", bad)));
    }
    let digit_at = |i: isize| -> u16 {
        if i >= 0 && (i as usize) < digits.len() {
            digits[i as usize]
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == SIGN_NEG && ndigits > 0 {
        out.push('-');
    }

    // Integer part: groups 0..=weight
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(i)));
        }
    }

    // Fraction: groups after weight, truncated to dscale decimal digits
    if dscale > 0 {
        out.push('.');
        let mut written = 0;
        let mut i = weight + 1;
        while written < dscale {
            let group = format!("{:04}", digit_at(i));
            for c in group.chars().take(dscale - written) {
                out.push(c);
                written += 1;
            }
            i += 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_integer_values() {
        assert_eq!(to_decimal_string(&numeric(0, SIGN_POS, 0, &[])).unwrap(), "0");
        assert_eq!(to_decimal_string(&numeric(0, SIGN_POS, 0, &[42])).unwrap(), "42");
        assert_eq!(
            to_decimal_string(&numeric(1, SIGN_NEG, 0, &[12, 3456])).unwrap(),
            "-123456"
        );
        // 10^8 stored as a single digit with trailing zero groups omitted
        assert_eq!(
            to_decimal_string(&numeric(2, SIGN_POS, 0, &[1])).unwrap(),
            "100000000"
        );
    }

    #[test]
    fn test_fractional_values() {
        // 3.14
        assert_eq!(
            to_decimal_string(&numeric(0, SIGN_POS, 2, &[3, 1400])).unwrap(),
            "3.14"
        );
        // 0.0005
        assert_eq!(
            to_decimal_string(&numeric(-1, SIGN_POS, 4, &[5])).unwrap(),
            "0.0005"
        );
        // 0.00000001 has a leading all-zero fractional group
        assert_eq!(
            to_decimal_string(&numeric(-2, SIGN_POS, 8, &[1])).unwrap(),
            "0.00000001"
        );
        // Display scale pads past the stored digits
        assert_eq!(
            to_decimal_string(&numeric(0, SIGN_NEG, 3, &[7])).unwrap(),
            "-7.000"
        );
    }

    #[test]
    fn test_special_values() {
        assert_eq!(to_decimal_string(&numeric(0, SIGN_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(
            to_decimal_string(&numeric(0, SIGN_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn test_malformed() {
        assert!(to_decimal_string(&[0, 1]).is_err());
        let mut truncated = numeric(0, SIGN_POS, 0, &[1, 2]);
        truncated.pop();
        assert!(to_decimal_string(&truncated).is_err());
        assert!(to_decimal_string(&numeric(0, 0x1234, 0, &[1])).is_err());
        assert!(to_decimal_string(&numeric(0, SIGN_POS, 0, &[10_000])).is_err());
    }
}
