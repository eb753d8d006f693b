//! Numeric literals of the register protocol.
//!
//! Both parsers only accept a literal that is immediately followed by the end of its token,
//! so that garbage such as `12x` is rejected instead of being read as `12`.

const MAX_INT_DIGITS: usize = 9;

const fn is_terminator(byte: Option<u8>) -> bool {
    matches!(byte, None | Some(b' ' | b'\t' | b']' | b')' | b'\r' | b'\n' | 0))
}

fn sign(bytes: &[u8]) -> (bool, usize) {
    match bytes.first() {
        Some(b'-') => (true, 1),
        Some(b'+') => (false, 1),
        _ => (false, 0),
    }
}

/// Parse a signed decimal integer of at most nine digits.
pub fn parse_int(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    let (negative, mut index) = sign(bytes);
    let mut value = 0i32;
    let mut digits = 0;
    while let Some(&byte) = bytes.get(index) {
        if !byte.is_ascii_digit() {
            break;
        }
        if digits == MAX_INT_DIGITS {
            return None;
        }
        value = value * 10 + i32::from(byte - b'0');
        digits += 1;
        index += 1;
    }
    if digits == 0 || !is_terminator(bytes.get(index).copied()) {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Parse a float with an optional SI prefix (`n u m K M G`) or a decimal exponent.
///
/// The decimal exponent is applied one factor of ten at a time, which the device firmware
/// does too; literals with extreme exponents round exactly like they do on the device.
pub fn parse_float(text: &str) -> Option<f32> {
    let bytes = text.as_bytes();
    let (negative, mut index) = sign(bytes);
    let mut mantissa = 0f32;
    let mut exponent = 0i32;
    let mut digits = 0;
    while let Some(byte) = bytes.get(index).filter(|b| b.is_ascii_digit()) {
        mantissa = mantissa * 10.0 + f32::from(byte - b'0');
        digits += 1;
        index += 1;
    }
    if bytes.get(index) == Some(&b'.') {
        index += 1;
        while let Some(byte) = bytes.get(index).filter(|b| b.is_ascii_digit()) {
            mantissa = mantissa * 10.0 + f32::from(byte - b'0');
            exponent -= 1;
            digits += 1;
            index += 1;
        }
    }
    if digits == 0 {
        return None;
    }
    let suffix = match bytes.get(index) {
        Some(b'n') => Some(-9),
        Some(b'u') => Some(-6),
        Some(b'm') => Some(-3),
        Some(b'K') => Some(3),
        Some(b'M') => Some(6),
        Some(b'G') => Some(9),
        _ => None,
    };
    if let Some(shift) = suffix {
        exponent += shift;
        index += 1;
    } else if let Some(b'e' | b'E') = bytes.get(index) {
        // `parse_int` checks the terminator on our behalf.
        exponent = exponent.saturating_add(parse_int(&text[index + 1..])?);
        index = bytes.len();
    }
    if !is_terminator(bytes.get(index).copied()) {
        return None;
    }
    while exponent < 0 && mantissa != 0.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    while exponent > 0 && mantissa.is_finite() && mantissa != 0.0 {
        mantissa *= 10.0;
        exponent -= 1;
    }
    Some(if negative { -mantissa } else { mantissa })
}

/// Render a float so that [`parse_float`] reads back (nearly) the same value.
pub fn format_float(value: f32) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e7).contains(&magnitude) {
        format!("{value}")
    } else {
        format!("{value:e}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-5 * a.abs().max(b.abs()).max(f32::MIN_POSITIVE)
    }

    #[test]
    fn integers() {
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("+42"), Some(42));
        assert_eq!(parse_int("-7 rest"), Some(-7));
        assert_eq!(parse_int("123456789"), Some(123456789));
        assert_eq!(parse_int("12]"), Some(12));
        assert_eq!(parse_int("12)"), Some(12));
        assert_eq!(parse_int("12\r\n"), Some(12));
    }

    #[test]
    fn integer_rejections() {
        assert_eq!(parse_int("1234567890"), None);
        assert_eq!(parse_int("12x"), None);
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("-"), None);
        assert_eq!(parse_int("1.5"), None);
    }

    #[test]
    fn si_suffixes() {
        assert!(close(parse_float("12K").unwrap(), 12000.0));
        assert!(close(parse_float("1.5m").unwrap(), 0.0015));
        assert!(close(parse_float("3n").unwrap(), 3e-9));
        assert!(close(parse_float("47u").unwrap(), 47e-6));
        assert!(close(parse_float("2.2M").unwrap(), 2.2e6));
        assert!(close(parse_float("1G").unwrap(), 1e9));
    }

    #[test]
    fn exponents_and_terminators() {
        assert!(close(parse_float("-3.2e-2").unwrap(), -0.032));
        assert!(close(parse_float("4E3").unwrap(), 4000.0));
        assert!(close(parse_float("1.23]").unwrap(), 1.23));
        assert!(close(parse_float(".5").unwrap(), 0.5));
        assert!(close(parse_float("5.").unwrap(), 5.0));
        assert!(close(parse_float("+7.25 (V)").unwrap(), 7.25));
    }

    #[test]
    fn float_rejections() {
        assert_eq!(parse_float("12x"), None);
        assert_eq!(parse_float("."), None);
        assert_eq!(parse_float("-"), None);
        assert_eq!(parse_float("1e"), None);
        assert_eq!(parse_float("1e1234567890"), None);
        assert_eq!(parse_float("1Kx"), None);
        assert_eq!(parse_float("1.2.3"), None);
    }

    #[test]
    fn extreme_exponents_saturate() {
        assert_eq!(parse_float("1e-999999999"), Some(0.0));
        assert_eq!(parse_float("1e999999999"), Some(f32::INFINITY));
    }

    #[test]
    fn formatting_reparses() {
        for value in [0.0, 1.5, -0.032, 12000.0, 3e-9, 2.5e12] {
            let text = format_float(value);
            assert!(close(parse_float(&text).unwrap(), value), "{text}");
        }
    }

    proptest! {
        #[test]
        fn numeric_round_trip(value in -1.0e9f32..1.0e9f32) {
            let text = format_float(value);
            let parsed = parse_float(&text);
            prop_assert!(parsed.is_some(), "{} did not parse", text);
            prop_assert!(close(parsed.unwrap(), value), "{} -> {:?}", text, parsed);
        }
    }
}
