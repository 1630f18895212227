//! Numbers and bigints.

use crate::engine::{to_int32, to_uint32, utf16, Engine, ValueKind};
use crate::env::Env;
use crate::error::{fatal_error, Error, Result};

/// Base-10 integer text split into sign and magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decimal {
    Fits { negative: bool, magnitude: u64 },
    Overflow { negative: bool },
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut magnitude: u64 = 0;
    for digit in digits.bytes() {
        let next = magnitude
            .checked_mul(10)
            .and_then(|m| m.checked_add(u64::from(digit - b'0')));
        match next {
            Some(m) => magnitude = m,
            None => return Some(Decimal::Overflow { negative }),
        }
    }
    Some(Decimal::Fits {
        negative,
        magnitude,
    })
}

/// `(value, lossless)`; out of range clamps
fn decimal_to_i64(decimal: Decimal) -> (i64, bool) {
    const MIN_MAGNITUDE: u64 = 1 << 63;
    match decimal {
        Decimal::Fits {
            negative: false,
            magnitude,
        } => match i64::try_from(magnitude) {
            Ok(value) => (value, true),
            Err(_) => (i64::MAX, false),
        },
        Decimal::Fits {
            negative: true,
            magnitude,
        } if magnitude <= MIN_MAGNITUDE => ((magnitude as i64).wrapping_neg(), true),
        Decimal::Fits { negative: true, .. } | Decimal::Overflow { negative: true } => {
            (i64::MIN, false)
        }
        Decimal::Overflow { negative: false } => (i64::MAX, false),
    }
}

/// `(value, lossless)`; negatives wrap, overflow clamps
fn decimal_to_u64(decimal: Decimal) -> (u64, bool) {
    match decimal {
        Decimal::Fits {
            negative: false,
            magnitude,
        } => (magnitude, true),
        Decimal::Fits {
            negative: true,
            magnitude,
        } => (magnitude.wrapping_neg(), magnitude == 0),
        Decimal::Overflow { .. } => (u64::MAX, false),
    }
}

impl<E: Engine> Env<E> {
    /// Number from an `f64`
    pub fn create_double(&self, value: f64) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().number(value)))
    }

    /// Number from an `i32`
    pub fn create_int32(&self, value: i32) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().number(f64::from(value))))
    }

    /// Number from a `u32`
    pub fn create_uint32(&self, value: u32) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().number(f64::from(value))))
    }

    /// Number from an `i64`; precision beyond 2^53 is lost
    pub fn create_int64(&self, value: i64) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().number(value as f64)))
    }

    fn number_value(&self, value: &E::Value) -> Result<f64> {
        self.expect_kind(value, ValueKind::Number, Error::NumberExpected)?;
        self.capture(self.engine().to_number(value))
    }

    /// Number as `f64`
    pub fn get_value_double(&self, value: &E::Value) -> Result<f64> {
        self.entry(|| self.number_value(value))
    }

    /// Number as `i32`, with ECMAScript ToInt32 wrapping
    pub fn get_value_int32(&self, value: &E::Value) -> Result<i32> {
        self.entry(|| Ok(to_int32(self.number_value(value)?)))
    }

    /// Number as `u32`, with ECMAScript ToUint32 wrapping
    pub fn get_value_uint32(&self, value: &E::Value) -> Result<u32> {
        self.entry(|| Ok(to_uint32(self.number_value(value)?)))
    }

    /// Number as `i64`. Non-finite values give 0, others saturate.
    pub fn get_value_int64(&self, value: &E::Value) -> Result<i64> {
        self.entry(|| {
            let number = self.number_value(value)?;
            Ok(if number.is_finite() { number as i64 } else { 0 })
        })
    }

    /// Boolean as `bool`
    pub fn get_value_bool(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| {
            self.expect_kind(value, ValueKind::Boolean, Error::BooleanExpected)?;
            Ok(self.engine().to_boolean(value))
        })
    }

    fn bigint_from_decimal(&self, text: &str) -> Result<E::Value> {
        let bigint = self.global_named("BigInt")?;
        let undefined = self.engine().undefined();
        let argument = self.engine().string(&utf16(text));
        self.capture(self.engine().call(&bigint, &undefined, &[argument]))
    }

    fn bigint_decimal(&self, value: &E::Value) -> Result<Decimal> {
        self.expect_kind(value, ValueKind::BigInt, Error::BigintExpected)?;
        let units = self.capture(self.engine().to_string(value))?;
        parse_decimal(&String::from_utf16_lossy(&units)).ok_or(Error::GenericFailure)
    }

    /// BigInt from an `i64`
    pub fn create_bigint_int64(&self, value: i64) -> Result<E::Value> {
        self.entry(|| self.bigint_from_decimal(&value.to_string()))
    }

    /// BigInt from a `u64`
    pub fn create_bigint_uint64(&self, value: u64) -> Result<E::Value> {
        self.entry(|| self.bigint_from_decimal(&value.to_string()))
    }

    /// BigInt as `(i64, lossless)`
    pub fn get_value_bigint_int64(&self, value: &E::Value) -> Result<(i64, bool)> {
        self.entry(|| Ok(decimal_to_i64(self.bigint_decimal(value)?)))
    }

    /// BigInt as `(u64, lossless)`
    pub fn get_value_bigint_uint64(&self, value: &E::Value) -> Result<(u64, bool)> {
        self.entry(|| Ok(decimal_to_u64(self.bigint_decimal(value)?)))
    }

    /// Not supported by this binding
    pub fn create_bigint_words(&self, _sign_bit: bool, _words: &[u64]) -> Result<E::Value> {
        fatal_error("napi_create_bigint_words", "bigint words are not supported")
    }

    /// Not supported by this binding
    pub fn get_value_bigint_words(
        &self,
        _value: &E::Value,
        _words: &mut [u64],
    ) -> Result<(bool, usize)> {
        fatal_error("napi_get_value_bigint_words", "bigint words are not supported")
    }
}
