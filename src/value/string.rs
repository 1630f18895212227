//! Strings in Latin-1, UTF-8 and UTF-16.
//!
//! The `get_value_string_*` calls follow the ABI buffer protocol: without a
//! buffer they report the full length in the target encoding; with one they
//! copy at most `len - 1` units, NUL-terminate and report the units copied.

use crate::engine::{Engine, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};

/// Longest prefix of `text` that fits in `limit` bytes without splitting a
/// character
fn utf8_prefix(text: &str, limit: usize) -> &str {
    if limit >= text.len() {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn copy_terminated<T: Copy + Default>(source: &[T], buffer: &mut [T]) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let copied = source.len().min(buffer.len() - 1);
    buffer[..copied].copy_from_slice(&source[..copied]);
    buffer[copied] = T::default();
    copied
}

impl<E: Engine> Env<E> {
    /// String from Latin-1 bytes
    pub fn create_string_latin1(&self, bytes: &[u8]) -> Result<E::Value> {
        self.entry(|| {
            let units: Vec<u16> = bytes.iter().map(|&b| u16::from(b)).collect();
            Ok(self.engine().string(&units))
        })
    }

    /// String from UTF-8 bytes; invalid sequences become U+FFFD
    pub fn create_string_utf8(&self, bytes: &[u8]) -> Result<E::Value> {
        self.entry(|| {
            let units: Vec<u16> = String::from_utf8_lossy(bytes).encode_utf16().collect();
            Ok(self.engine().string(&units))
        })
    }

    /// String from UTF-16 code units
    pub fn create_string_utf16(&self, units: &[u16]) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().string(units)))
    }

    fn string_units(&self, value: &E::Value) -> Result<Vec<u16>> {
        self.expect_kind(value, ValueKind::String, Error::StringExpected)?;
        self.capture(self.engine().to_string(value))
    }

    /// Copy a string as Latin-1. Characters above U+00FF become `?`.
    pub fn get_value_string_latin1(
        &self,
        value: &E::Value,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize> {
        self.entry(|| {
            let units = self.string_units(value)?;
            let bytes: Vec<u8> = units
                .iter()
                .map(|&unit| u8::try_from(unit).unwrap_or(b'?'))
                .collect();
            Ok(match buffer {
                Some(buffer) => copy_terminated(&bytes, buffer),
                None => bytes.len(),
            })
        })
    }

    /// Copy a string as UTF-8 without splitting a character
    pub fn get_value_string_utf8(
        &self,
        value: &E::Value,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize> {
        self.entry(|| {
            let text = String::from_utf16_lossy(&self.string_units(value)?);
            Ok(match buffer {
                Some(buffer) if buffer.is_empty() => 0,
                Some(buffer) => {
                    let prefix = utf8_prefix(&text, buffer.len() - 1);
                    copy_terminated(prefix.as_bytes(), buffer)
                }
                None => text.len(),
            })
        })
    }

    /// Copy a string as UTF-16 code units
    pub fn get_value_string_utf16(
        &self,
        value: &E::Value,
        buffer: Option<&mut [u16]>,
    ) -> Result<usize> {
        self.entry(|| {
            let units = self.string_units(value)?;
            Ok(match buffer {
                Some(buffer) => copy_terminated(&units, buffer),
                None => units.len(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_support::test_env;

    #[test]
    fn test_utf8_length_query_and_copy() {
        let (env, _executor) = test_env();
        let value = env.create_string_utf8("héllo".as_bytes()).unwrap();
        assert_eq!(env.get_value_string_utf8(&value, None).unwrap(), 6);

        let mut buffer = [0xffu8; 16];
        let copied = env.get_value_string_utf8(&value, Some(&mut buffer)).unwrap();
        assert_eq!(copied, 6);
        assert_eq!(&buffer[..7], "héllo\0".as_bytes());
    }

    #[test]
    fn test_utf8_truncation_keeps_characters_whole() {
        let (env, _executor) = test_env();
        let value = env.create_string_utf8("aé".as_bytes()).unwrap();

        // Room for "a" and half of "é": the partial character is dropped
        let mut buffer = [0xffu8; 3];
        let copied = env.get_value_string_utf8(&value, Some(&mut buffer)).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(buffer[..2], [b'a', 0]);

        let mut empty: [u8; 0] = [];
        assert_eq!(env.get_value_string_utf8(&value, Some(&mut empty)).unwrap(), 0);
    }

    #[test]
    fn test_latin1_replaces_wide_characters() {
        let (env, _executor) = test_env();
        let value = env.create_string_utf16(&[0x41, 0xe9, 0x263a]).unwrap();
        assert_eq!(env.get_value_string_latin1(&value, None).unwrap(), 3);

        let mut buffer = [0u8; 8];
        let copied = env.get_value_string_latin1(&value, Some(&mut buffer)).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(&buffer[..4], &[0x41, 0xe9, b'?', 0]);

        let latin1 = env.create_string_latin1(&[0x63, 0x61, 0x66, 0xe9]).unwrap();
        let mut units = [0u16; 5];
        env.get_value_string_utf16(&latin1, Some(&mut units)).unwrap();
        assert_eq!(units, [0x63, 0x61, 0x66, 0xe9, 0]);
    }

    #[test]
    fn test_utf16_truncation() {
        let (env, _executor) = test_env();
        let value = env.create_string_utf8(b"abcdef").unwrap();
        let mut buffer = [0xffffu16; 4];
        let copied = env.get_value_string_utf16(&value, Some(&mut buffer)).unwrap();
        assert_eq!(copied, 3);
        assert_eq!(buffer, [0x61, 0x62, 0x63, 0]);
    }

    #[test]
    fn test_non_string_rejected() {
        let (env, _executor) = test_env();
        let number = env.create_double(1.0).unwrap();
        assert_eq!(
            env.get_value_string_utf8(&number, None),
            Err(Error::StringExpected)
        );
    }
}
