//! Value and type bridging.
//!
//! Conversions between ABI values and engine values. Features the engine
//! lacks natively are reached through its global scope: bigints through
//! `BigInt(decimal)`, promises through a captured executor, type tags
//! through a side `WeakMap`.

mod buffer;
mod date;
mod exception;
mod number;
mod object;
mod promise;
mod string;
mod type_tag;

pub use buffer::{DataViewInfo, TypedArrayView};
pub use object::{KeyCollectionMode, KeyConversion, KeyFilter};
pub use promise::Deferred;
pub use type_tag::TypeTag;

use crate::engine::{utf16, Engine, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::native::NativeKind;

/// ABI value type, in ABI order
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean,
    /// Number
    Number,
    /// String
    String,
    /// Symbol
    Symbol,
    /// Object that is neither callable nor an external
    Object,
    /// Callable object
    Function,
    /// Value created by `create_external`
    External,
    /// BigInt
    Bigint,
}

impl<E: Engine> Env<E> {
    pub(crate) fn name(&self, text: &str) -> E::Value {
        self.engine().string(&utf16(text))
    }

    /// `object[name]`, capturing exceptions
    pub(crate) fn named_property(&self, object: &E::Value, name: &str) -> Result<E::Value> {
        self.capture(self.engine().get_property(object, &self.name(name)))
    }

    /// A binding of the global scope
    pub(crate) fn global_named(&self, name: &str) -> Result<E::Value> {
        self.named_property(&self.engine().global(), name)
    }

    pub(crate) fn expect_object(&self, value: &E::Value) -> Result<()> {
        match self.engine().kind(value) {
            ValueKind::Object | ValueKind::Function => Ok(()),
            _ => Err(Error::ObjectExpected),
        }
    }

    pub(crate) fn expect_kind(
        &self,
        value: &E::Value,
        kind: ValueKind,
        error: Error,
    ) -> Result<()> {
        if self.engine().kind(value) == kind {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Whether `value` is an instance of the global constructor `name`
    pub(crate) fn is_instance_of_global(&self, value: &E::Value, name: &str) -> Result<bool> {
        let constructor = self.global_named(name)?;
        self.capture(self.engine().instance_of(value, &constructor))
    }

    /// `undefined`
    pub fn get_undefined(&self) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().undefined()))
    }

    /// `null`
    pub fn get_null(&self) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().null()))
    }

    /// Boolean primitive
    pub fn get_boolean(&self, value: bool) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().boolean(value)))
    }

    /// The global object
    pub fn get_global(&self) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().global()))
    }

    /// Fresh symbol; the description must be a string when given
    pub fn create_symbol(&self, description: Option<&E::Value>) -> Result<E::Value> {
        self.entry(|| {
            let description = match description {
                Some(value) => {
                    self.expect_kind(value, ValueKind::String, Error::StringExpected)?;
                    Some(self.capture(self.engine().to_string(value))?)
                }
                None => None,
            };
            Ok(self.engine().symbol(description.as_deref()))
        })
    }

    /// Classify a value. Externals are told apart by their record.
    pub fn type_of(&self, value: &E::Value) -> Result<ValueType> {
        self.entry(|| {
            Ok(match self.engine().kind(value) {
                ValueKind::Undefined => ValueType::Undefined,
                ValueKind::Null => ValueType::Null,
                ValueKind::Boolean => ValueType::Boolean,
                ValueKind::Number => ValueType::Number,
                ValueKind::String => ValueType::String,
                ValueKind::Symbol => ValueType::Symbol,
                ValueKind::BigInt => ValueType::Bigint,
                ValueKind::Function => ValueType::Function,
                ValueKind::Object => match self.native_kind(value) {
                    Some(NativeKind::External) => ValueType::External,
                    _ => ValueType::Object,
                },
            })
        })
    }

    /// `a === b`
    pub fn strict_equals(&self, a: &E::Value, b: &E::Value) -> Result<bool> {
        self.entry(|| Ok(self.engine().strict_equals(a, b)))
    }

    /// ECMAScript ToBoolean
    pub fn coerce_to_bool(&self, value: &E::Value) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().boolean(self.engine().to_boolean(value))))
    }

    /// ECMAScript ToNumber
    pub fn coerce_to_number(&self, value: &E::Value) -> Result<E::Value> {
        self.entry_js(|| {
            let number = self.capture(self.engine().to_number(value))?;
            Ok(self.engine().number(number))
        })
    }

    /// ECMAScript ToObject
    pub fn coerce_to_object(&self, value: &E::Value) -> Result<E::Value> {
        self.entry_js(|| self.capture(self.engine().to_object(value)))
    }

    /// ECMAScript ToString
    pub fn coerce_to_string(&self, value: &E::Value) -> Result<E::Value> {
        self.entry_js(|| {
            let units = self.capture(self.engine().to_string(value))?;
            Ok(self.engine().string(&units))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::heap::HeapValue;
    use crate::env::test_support::test_env;
    use std::ptr;

    fn noop(
        _env: &Env<crate::engine::heap::HeapEngine>,
        _info: &crate::native::CallbackInfo<crate::engine::heap::HeapEngine>,
    ) -> Option<HeapValue> {
        None
    }

    #[test]
    fn test_type_of() {
        let (env, _executor) = test_env();
        let cases = [
            (env.get_undefined().unwrap(), ValueType::Undefined),
            (env.get_null().unwrap(), ValueType::Null),
            (env.get_boolean(true).unwrap(), ValueType::Boolean),
            (env.create_double(1.0).unwrap(), ValueType::Number),
            (env.create_string_utf8(b"s").unwrap(), ValueType::String),
            (env.create_symbol(None).unwrap(), ValueType::Symbol),
            (env.create_object().unwrap(), ValueType::Object),
            (
                env.create_function("f", noop, ptr::null_mut()).unwrap(),
                ValueType::Function,
            ),
            (
                env.create_external(ptr::null_mut(), None, ptr::null_mut())
                    .unwrap(),
                ValueType::External,
            ),
            (env.create_bigint_int64(-3).unwrap(), ValueType::Bigint),
        ];
        for (value, expected) in cases {
            assert_eq!(env.type_of(&value).unwrap(), expected, "{:?}", value);
        }
    }

    #[test]
    fn test_symbol_description_must_be_string() {
        let (env, _executor) = test_env();
        let number = env.create_double(1.0).unwrap();
        assert_eq!(env.create_symbol(Some(&number)), Err(Error::StringExpected));

        let a = env.create_symbol(None).unwrap();
        let b = env.create_symbol(None).unwrap();
        assert!(!env.strict_equals(&a, &b).unwrap());
        assert!(env.strict_equals(&a, &a).unwrap());
    }

    #[test]
    fn test_coercions() {
        let (env, _executor) = test_env();
        let text = env.create_string_utf8(b"12.5").unwrap();
        assert_eq!(env.coerce_to_number(&text).unwrap(), HeapValue::Number(12.5));

        let zero = env.create_double(0.0).unwrap();
        assert_eq!(env.coerce_to_bool(&zero).unwrap(), HeapValue::Bool(false));

        let number = env.create_int32(7).unwrap();
        assert_eq!(env.coerce_to_string(&number).unwrap(), HeapValue::string("7"));

        let boxed = env.coerce_to_object(&number).unwrap();
        assert_eq!(env.type_of(&boxed).unwrap(), ValueType::Object);

        let undefined = env.get_undefined().unwrap();
        assert_eq!(env.coerce_to_object(&undefined), Err(Error::PendingException));
        env.get_and_clear_last_exception().unwrap();
    }
}
