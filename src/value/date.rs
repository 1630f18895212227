//! Dates.

use crate::engine::Engine;
use crate::env::Env;
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};

impl<E: Engine> Env<E> {
    /// `new Date(time)` with `time` in milliseconds since the epoch
    pub fn create_date(&self, time: f64) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().make_date(time)))
    }

    /// Whether `value` is a `Date`
    pub fn is_date(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| Ok(self.engine().is_date(value)))
    }

    /// Time value of a `Date` in milliseconds; NaN for invalid dates
    pub fn get_date_value(&self, value: &E::Value) -> Result<f64> {
        self.entry(|| {
            if !self.engine().is_date(value) {
                return Err(Error::InvalidArg);
            }
            self.capture(self.engine().to_number(value))
        })
    }

    /// `Date` for a UTC timestamp, at millisecond precision
    pub fn create_date_from_utc(&self, time: DateTime<Utc>) -> Result<E::Value> {
        self.create_date(time.timestamp_millis() as f64)
    }

    /// UTC timestamp of a `Date`; `None` for invalid dates
    pub fn get_date_value_utc(&self, value: &E::Value) -> Result<Option<DateTime<Utc>>> {
        let time = self.get_date_value(value)?;
        if !time.is_finite() {
            return Ok(None);
        }
        Ok(Utc.timestamp_millis_opt(time as i64).single())
    }
}
