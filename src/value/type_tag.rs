//! Type tags.
//!
//! Tags live in a per-environment `WeakMap` from object to a 16-byte
//! `ArrayBuffer`, created on first use and protected for the environment's
//! lifetime.

use crate::engine::{BufferKind, Engine};
use crate::env::Env;
use crate::error::{Error, Result};
use std::ptr;
use tracing::debug;

/// 128-bit tag identifying the native type behind an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeTag {
    /// Low 64 bits
    pub lower: u64,
    /// High 64 bits
    pub upper: u64,
}

impl TypeTag {
    /// Tag from its two halves
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.lower.to_le_bytes());
        bytes[8..].copy_from_slice(&self.upper.to_le_bytes());
        bytes
    }
}

impl<E: Engine> Env<E> {
    fn type_tag_map(&self) -> Result<E::Value> {
        self.type_tags
            .get_or_try_init(|| {
                let constructor = self.global_named("WeakMap")?;
                let map = self.capture(self.engine().construct(&constructor, &[]))?;
                self.engine().protect(&map);
                debug!(env = %self.id(), "Created type tag map");
                Ok(map)
            })
            .cloned()
    }

    fn call_map(&self, map: &E::Value, method: &str, args: &[E::Value]) -> Result<E::Value> {
        let function = self.named_property(map, method)?;
        self.capture(self.engine().call(&function, map, args))
    }

    /// Tag `object` once; tagging it again is an error
    pub fn type_tag_object(&self, object: &E::Value, tag: &TypeTag) -> Result<()> {
        self.entry_js(|| {
            self.expect_object(object)?;
            let map = self.type_tag_map()?;
            let present = self.call_map(&map, "has", &[object.clone()])?;
            if self.engine().to_boolean(&present) {
                return Err(Error::InvalidArg);
            }

            let bytes = tag.to_bytes();
            let buffer = self.capture(self.engine().make_array_buffer(bytes.len()))?;
            let (data, len) = self
                .engine()
                .array_buffer_data(&buffer)
                .ok_or(Error::GenericFailure)?;
            if len != bytes.len() {
                return Err(Error::GenericFailure);
            }
            // SAFETY: `data` points at the 16 bytes of the buffer just created
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len()) };

            self.call_map(&map, "set", &[object.clone(), buffer])?;
            Ok(())
        })
    }

    /// Whether `object` carries exactly `tag`
    pub fn check_object_type_tag(&self, object: &E::Value, tag: &TypeTag) -> Result<bool> {
        self.entry_js(|| {
            self.expect_object(object)?;
            let Some(map) = self.type_tags.get().cloned() else {
                return Ok(false);
            };
            let stored = self.call_map(&map, "get", &[object.clone()])?;
            if self.engine().buffer_kind(&stored) != BufferKind::ArrayBuffer {
                return Ok(false);
            }
            let Some((data, len)) = self.engine().array_buffer_data(&stored) else {
                return Ok(false);
            };
            let expected = tag.to_bytes();
            if len != expected.len() {
                return Ok(false);
            }
            // SAFETY: the stored buffer is alive and `len` bytes long
            let actual = unsafe { std::slice::from_raw_parts(data, len) };
            Ok(actual == expected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_support::test_env;

    const FILE_HANDLE: TypeTag = TypeTag::new(0x1edf_75a3_8336_4a5b, 0xb64b_26a7_5fd8_3f0d);
    const DATABASE: TypeTag = TypeTag::new(0x1edf_75a3_8336_4a5b, 0x0000_0000_0000_0001);

    #[test]
    fn test_tag_bytes_little_endian() {
        let bytes = TypeTag::new(1, 2).to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[15], 0);
    }

    #[test]
    fn test_tag_and_check() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let other = env.create_object().unwrap();

        assert!(!env.check_object_type_tag(&object, &FILE_HANDLE).unwrap());
        env.type_tag_object(&object, &FILE_HANDLE).unwrap();
        assert!(env.check_object_type_tag(&object, &FILE_HANDLE).unwrap());
        assert!(!env.check_object_type_tag(&object, &DATABASE).unwrap());
        assert!(!env.check_object_type_tag(&other, &FILE_HANDLE).unwrap());

        assert_eq!(
            env.type_tag_object(&object, &DATABASE),
            Err(Error::InvalidArg)
        );
        let number = env.create_int32(1).unwrap();
        assert_eq!(
            env.type_tag_object(&number, &FILE_HANDLE),
            Err(Error::ObjectExpected)
        );
    }

    #[test]
    fn test_tag_map_is_protected_and_weak() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        env.type_tag_object(&object, &FILE_HANDLE).unwrap();
        let map = env.type_tags.get().cloned().unwrap();
        assert_eq!(env.engine().protect_count(&map), 1);

        env.engine().collect();
        assert!(env.engine().is_alive(&map));
        assert!(!env.engine().is_alive(&object));
    }
}
