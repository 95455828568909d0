//! Kubernetes resource quantity parsing
//!
//! Quantities are kept as `mantissa * 10^exp10 * 1024^exp2` so that unit
//! conversions stay exact and ceiling rounding never suffers from binary
//! floating point error (`0.1` CPU is exactly 100 millicores).

use thiserror::Error;

/// Longest mantissa accepted, keeps the i128 arithmetic overflow-free
const MAX_MANTISSA_DIGITS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    #[error("unknown suffix in quantity {0:?}")]
    UnknownSuffix(String),
}

/// An exactly-represented quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedQuantity {
    mantissa: i128,
    exp10: i32,
    exp2: i32,
}

impl ParsedQuantity {
    pub const ZERO: ParsedQuantity = ParsedQuantity {
        mantissa: 0,
        exp10: 0,
        exp2: 0,
    };

    /// Value expressed in millicores (or milli-units), rounded up
    pub fn millis_ceil(&self) -> i64 {
        self.scaled_ceil(3, 0)
    }

    /// Value expressed in kibibytes, rounded up
    pub fn kib_ceil(&self) -> i64 {
        self.scaled_ceil(0, -1)
    }

    /// Value as a whole number, rounded up
    pub fn whole_ceil(&self) -> i64 {
        self.scaled_ceil(0, 0)
    }

    fn scaled_ceil(&self, shift10: i32, shift2: i32) -> i64 {
        if self.mantissa == 0 {
            return 0;
        }
        let e10 = self.exp10 + shift10;
        let e2 = self.exp2 + shift2;

        let numerator = pow_checked(10, e10.max(0))
            .and_then(|p| p.checked_mul(pow_checked(1024, e2.max(0))?))
            .and_then(|p| p.checked_mul(self.mantissa));
        let denominator =
            pow_checked(10, (-e10).max(0)).and_then(|p| p.checked_mul(pow_checked(1024, (-e2).max(0))?));

        match (numerator, denominator) {
            (Some(num), Some(den)) => clamp_i64(ceil_div(num, den)),
            // Numerator overflowed: saturate in the mantissa's direction
            (None, _) if self.mantissa > 0 => i64::MAX,
            (None, _) => i64::MIN,
            // Denominator overflowed: the value is a sliver either side of zero
            (Some(_), None) if self.mantissa > 0 => 1,
            (Some(_), None) => 0,
        }
    }
}

fn pow_checked(base: i128, exp: i32) -> Option<i128> {
    base.checked_pow(u32::try_from(exp).ok()?)
}

fn ceil_div(num: i128, den: i128) -> i128 {
    if num >= 0 {
        (num + den - 1) / den
    } else {
        num / den
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Parse a quantity string such as `1100m`, `512Mi`, `1.5G` or `2e3`
pub fn parse(input: &str) -> Result<ParsedQuantity, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = body
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_end);

    let mut mantissa: i128 = 0;
    let mut digits = 0usize;
    let mut fraction_digits = 0i32;
    let mut seen_dot = false;
    for c in number.chars() {
        if c == '.' {
            if seen_dot {
                return Err(QuantityError::InvalidNumber(input.to_string()));
            }
            seen_dot = true;
            continue;
        }
        digits += 1;
        if digits > MAX_MANTISSA_DIGITS {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }
        mantissa = mantissa * 10 + i128::from(c as u8 - b'0');
        if seen_dot {
            fraction_digits += 1;
        }
    }
    if digits == 0 {
        return Err(QuantityError::InvalidNumber(input.to_string()));
    }
    if negative {
        mantissa = -mantissa;
    }

    let (exp10, exp2) = parse_suffix(suffix).ok_or_else(|| QuantityError::UnknownSuffix(input.to_string()))?;

    Ok(ParsedQuantity {
        mantissa,
        exp10: exp10 - fraction_digits,
        exp2,
    })
}

fn parse_suffix(suffix: &str) -> Option<(i32, i32)> {
    let scale = match suffix {
        "" => (0, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        _ => {
            let exponent = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
            let value: i32 = exponent.parse().ok()?;
            // Guard against absurd exponents before they reach the arithmetic
            if value.abs() > 64 {
                return None;
            }
            (value, 0)
        }
    };
    Some(scale)
}

/// Millicores rounded up to whole cores
pub fn millis_to_cores_ceil(millis: i64) -> i64 {
    ceil_div(i128::from(millis), 1000) as i64
}

/// Kibibytes rounded up to mebibytes
pub fn kib_to_mib_ceil(kib: i64) -> i64 {
    ceil_div(i128::from(kib), 1024) as i64
}
