//! Array buffers, typed arrays and data views.
//!
//! Data pointers handed out here point into engine-owned storage and stay
//! valid while the backing `ArrayBuffer` is alive. Node's `Buffer` family and
//! buffer detaching have no counterpart in the engine and abort.

use crate::engine::{BufferKind, Engine, TypedArrayKind};
use crate::env::Env;
use crate::error::{fatal_error, Error, Result};
use crate::native::Finalize;
use std::ffi::c_void;
use tracing::trace;

/// Result of [`Env::get_typedarray_info`]
#[derive(Debug, Clone)]
pub struct TypedArrayView<V> {
    /// Element type
    pub kind: TypedArrayKind,
    /// Length in elements
    pub length: usize,
    /// First element of the view
    pub data: *mut u8,
    /// Backing `ArrayBuffer`
    pub arraybuffer: V,
    /// Offset of the view in the backing buffer, in bytes
    pub byte_offset: usize,
}

/// Result of [`Env::get_dataview_info`]
#[derive(Debug, Clone)]
pub struct DataViewInfo<V> {
    /// Length of the view in bytes
    pub byte_length: usize,
    /// First byte of the view
    pub data: *mut u8,
    /// Backing `ArrayBuffer`
    pub arraybuffer: V,
    /// Offset of the view in the backing buffer, in bytes
    pub byte_offset: usize,
}

impl<E: Engine> Env<E> {
    fn number_property(&self, object: &E::Value, name: &str) -> Result<usize> {
        let value = self.named_property(object, name)?;
        Ok(self.capture(self.engine().to_number(&value))? as usize)
    }

    /// Zero-filled `ArrayBuffer` and a pointer to its bytes
    pub fn create_arraybuffer(&self, byte_length: usize) -> Result<(E::Value, *mut u8)> {
        self.entry(|| {
            let buffer = self.capture(self.engine().make_array_buffer(byte_length))?;
            let (data, _) = self
                .engine()
                .array_buffer_data(&buffer)
                .ok_or(Error::GenericFailure)?;
            Ok((buffer, data))
        })
    }

    /// `ArrayBuffer` over caller-owned memory.
    ///
    /// `finalize` runs once the engine reclaims the buffer, provided the
    /// environment is still alive.
    pub fn create_external_arraybuffer(
        &self,
        data: *mut u8,
        byte_length: usize,
        finalize: Option<Finalize<E>>,
        hint: *mut c_void,
    ) -> Result<E::Value> {
        self.entry(|| {
            let env = self.downgrade();
            let release = Box::new(move || {
                let Some(finalize) = finalize else { return };
                if let Some(env) = env.upgrade() {
                    trace!(env = %env.id(), "Releasing external array buffer");
                    finalize(&env, data.cast(), hint);
                    env.metrics().finalizer_ran();
                }
            });
            self.capture(
                self.engine()
                    .make_external_array_buffer(data, byte_length, release),
            )
        })
    }

    /// Data pointer and length of an `ArrayBuffer`
    pub fn get_arraybuffer_info(&self, arraybuffer: &E::Value) -> Result<(*mut u8, usize)> {
        self.entry(|| {
            self.engine()
                .array_buffer_data(arraybuffer)
                .ok_or(Error::InvalidArg)
        })
    }

    /// Whether `value` is an `ArrayBuffer`
    pub fn is_arraybuffer(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| Ok(self.engine().buffer_kind(value) == BufferKind::ArrayBuffer))
    }

    /// Whether `value` is a typed array
    pub fn is_typedarray(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| {
            Ok(matches!(
                self.engine().buffer_kind(value),
                BufferKind::TypedArray(_)
            ))
        })
    }

    /// Typed array of `length` elements over `arraybuffer`.
    ///
    /// Misaligned offsets and out-of-range lengths throw a `RangeError`.
    pub fn create_typedarray(
        &self,
        kind: TypedArrayKind,
        length: usize,
        arraybuffer: &E::Value,
        byte_offset: usize,
    ) -> Result<E::Value> {
        self.entry_js(|| {
            if self.engine().buffer_kind(arraybuffer) != BufferKind::ArrayBuffer {
                return Err(Error::InvalidArg);
            }
            self.capture(
                self.engine()
                    .make_typed_array(kind, arraybuffer, byte_offset, length),
            )
        })
    }

    /// Element type, length, data pointer and backing buffer of a typed array
    pub fn get_typedarray_info(&self, typedarray: &E::Value) -> Result<TypedArrayView<E::Value>> {
        self.entry(|| {
            let info = self
                .engine()
                .typed_array_info(typedarray)
                .ok_or(Error::InvalidArg)?;
            let (base, _) = self
                .engine()
                .array_buffer_data(&info.buffer)
                .ok_or(Error::GenericFailure)?;
            Ok(TypedArrayView {
                kind: info.kind,
                length: info.length,
                data: base.wrapping_add(info.byte_offset),
                arraybuffer: info.buffer,
                byte_offset: info.byte_offset,
            })
        })
    }

    /// `new DataView(arraybuffer, byte_offset, byte_length)`
    pub fn create_dataview(
        &self,
        byte_length: usize,
        arraybuffer: &E::Value,
        byte_offset: usize,
    ) -> Result<E::Value> {
        self.entry_js(|| {
            if self.engine().buffer_kind(arraybuffer) != BufferKind::ArrayBuffer {
                return Err(Error::InvalidArg);
            }
            let constructor = self.global_named("DataView")?;
            let engine = self.engine();
            let args = [
                arraybuffer.clone(),
                engine.number(byte_offset as f64),
                engine.number(byte_length as f64),
            ];
            self.capture(engine.construct(&constructor, &args))
        })
    }

    /// Whether `value` is a `DataView`
    pub fn is_dataview(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| self.is_instance_of_global(value, "DataView"))
    }

    /// Length, data pointer and backing buffer of a `DataView`
    pub fn get_dataview_info(&self, dataview: &E::Value) -> Result<DataViewInfo<E::Value>> {
        self.entry(|| {
            if !self.is_instance_of_global(dataview, "DataView")? {
                return Err(Error::InvalidArg);
            }
            let arraybuffer = self.named_property(dataview, "buffer")?;
            let byte_offset = self.number_property(dataview, "byteOffset")?;
            let byte_length = self.number_property(dataview, "byteLength")?;
            let (base, _) = self
                .engine()
                .array_buffer_data(&arraybuffer)
                .ok_or(Error::InvalidArg)?;
            Ok(DataViewInfo {
                byte_length,
                data: base.wrapping_add(byte_offset),
                arraybuffer,
                byte_offset,
            })
        })
    }

    /// Not supported by this binding
    pub fn create_buffer(&self, _size: usize) -> Result<(E::Value, *mut u8)> {
        fatal_error("napi_create_buffer", "Buffer is not supported")
    }

    /// Not supported by this binding
    pub fn create_external_buffer(
        &self,
        _data: *mut u8,
        _length: usize,
        _finalize: Option<Finalize<E>>,
        _hint: *mut c_void,
    ) -> Result<E::Value> {
        fatal_error("napi_create_external_buffer", "Buffer is not supported")
    }

    /// Not supported by this binding
    pub fn create_buffer_copy(&self, _data: &[u8]) -> Result<(E::Value, *mut u8)> {
        fatal_error("napi_create_buffer_copy", "Buffer is not supported")
    }

    /// Not supported by this binding
    pub fn is_buffer(&self, _value: &E::Value) -> Result<bool> {
        fatal_error("napi_is_buffer", "Buffer is not supported")
    }

    /// Not supported by this binding
    pub fn get_buffer_info(&self, _value: &E::Value) -> Result<(*mut u8, usize)> {
        fatal_error("napi_get_buffer_info", "Buffer is not supported")
    }

    /// Not supported by this binding
    pub fn detach_arraybuffer(&self, _arraybuffer: &E::Value) -> Result<()> {
        fatal_error("napi_detach_arraybuffer", "detaching is not supported")
    }

    /// Not supported by this binding
    pub fn is_detached_arraybuffer(&self, _value: &E::Value) -> Result<bool> {
        fatal_error("napi_is_detached_arraybuffer", "detaching is not supported")
    }
}
