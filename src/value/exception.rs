//! Error construction and the pending-exception slot.

use crate::engine::{utf16, Engine, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};
use tracing::debug;

impl<E: Engine> Env<E> {
    /// `new <constructor>(message)` with `code` attached. Without a code the
    /// message doubles as the code.
    fn make_error(
        &self,
        constructor: &str,
        code: Option<&E::Value>,
        message: &E::Value,
    ) -> Result<E::Value> {
        self.expect_kind(message, ValueKind::String, Error::StringExpected)?;
        if let Some(code) = code {
            self.expect_kind(code, ValueKind::String, Error::StringExpected)?;
        }
        let constructor = self.global_named(constructor)?;
        let error = self.capture(self.engine().construct(&constructor, &[message.clone()]))?;
        let code = code.unwrap_or(message);
        self.capture(self.engine().set_property(&error, &self.name("code"), code))?;
        Ok(error)
    }

    fn throw_new(&self, constructor: &str, code: Option<&str>, message: &str) -> Result<()> {
        let engine = self.engine();
        let message = engine.string(&utf16(message));
        let code = code.map(|code| engine.string(&utf16(code)));
        let error = self.make_error(constructor, code.as_ref(), &message)?;
        self.set_exception(error);
        Ok(())
    }

    /// `new Error(message)` with a `code` property
    pub fn create_error(&self, code: Option<&E::Value>, message: &E::Value) -> Result<E::Value> {
        self.entry(|| self.make_error("Error", code, message))
    }

    /// `new TypeError(message)` with a `code` property
    pub fn create_type_error(
        &self,
        code: Option<&E::Value>,
        message: &E::Value,
    ) -> Result<E::Value> {
        self.entry(|| self.make_error("TypeError", code, message))
    }

    /// `new RangeError(message)` with a `code` property
    pub fn create_range_error(
        &self,
        code: Option<&E::Value>,
        message: &E::Value,
    ) -> Result<E::Value> {
        self.entry(|| self.make_error("RangeError", code, message))
    }

    /// Make `error` the pending exception
    pub fn throw(&self, error: &E::Value) -> Result<()> {
        self.entry_js(|| {
            self.set_exception(error.clone());
            Ok(())
        })
    }

    /// Throw a new `Error`
    pub fn throw_error(&self, code: Option<&str>, message: &str) -> Result<()> {
        self.entry_js(|| self.throw_new("Error", code, message))
    }

    /// Throw a new `TypeError`
    pub fn throw_type_error(&self, code: Option<&str>, message: &str) -> Result<()> {
        self.entry_js(|| self.throw_new("TypeError", code, message))
    }

    /// Throw a new `RangeError`
    pub fn throw_range_error(&self, code: Option<&str>, message: &str) -> Result<()> {
        self.entry_js(|| self.throw_new("RangeError", code, message))
    }

    /// `value instanceof Error`
    pub fn is_error(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| self.is_instance_of_global(value, "Error"))
    }

    /// Whether an exception is waiting to be surfaced
    pub fn is_exception_pending(&self) -> Result<bool> {
        self.entry(|| Ok(self.is_pending()))
    }

    /// Take the pending exception; `undefined` when there is none
    pub fn get_and_clear_last_exception(&self) -> Result<E::Value> {
        self.entry(|| {
            Ok(self
                .take_exception()
                .unwrap_or_else(|| self.engine().undefined()))
        })
    }

    /// Report an uncaught exception. The engine has no uncaught-exception
    /// hook, so the error becomes the pending exception.
    pub fn fatal_exception(&self, error: &E::Value) -> Result<()> {
        self.entry(|| {
            debug!(env = %self.id(), "Raising fatal exception as pending exception");
            self.set_exception(error.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::heap::HeapValue;
    use crate::env::test_support::test_env;

    #[test]
    fn test_error_code_defaults_to_message() {
        let (env, _executor) = test_env();
        let message = env.create_string_utf8(b"went wrong").unwrap();
        let error = env.create_error(None, &message).unwrap();
        assert!(env.is_error(&error).unwrap());
        assert_eq!(
            env.get_named_property(&error, "message").unwrap(),
            HeapValue::string("went wrong")
        );
        assert_eq!(
            env.get_named_property(&error, "code").unwrap(),
            HeapValue::string("went wrong")
        );

        let code = env.create_string_utf8(b"E_RANGE").unwrap();
        let range = env.create_range_error(Some(&code), &message).unwrap();
        assert_eq!(env.get_named_property(&range, "code").unwrap(), code);
        let range_error = env.get_named_property(&env.get_global().unwrap(), "RangeError").unwrap();
        assert!(env.instanceof(&range, &range_error).unwrap());
    }

    #[test]
    fn test_error_arguments_must_be_strings() {
        let (env, _executor) = test_env();
        let number = env.create_int32(1).unwrap();
        let message = env.create_string_utf8(b"m").unwrap();
        assert_eq!(env.create_type_error(None, &number), Err(Error::StringExpected));
        assert_eq!(
            env.create_error(Some(&number), &message),
            Err(Error::StringExpected)
        );
    }

    #[test]
    fn test_pending_exception_slot() {
        let (env, _executor) = test_env();
        assert!(!env.is_exception_pending().unwrap());
        assert_eq!(env.get_and_clear_last_exception().unwrap(), HeapValue::Undefined);

        env.throw_type_error(Some("E_TYPE"), "bad type").unwrap();
        assert!(env.is_exception_pending().unwrap());

        // Only one exception can be outstanding
        assert_eq!(env.throw_error(None, "second"), Err(Error::PendingException));

        let thrown = env.get_and_clear_last_exception().unwrap();
        assert_eq!(
            env.get_named_property(&thrown, "code").unwrap(),
            HeapValue::string("E_TYPE")
        );
        assert!(!env.is_exception_pending().unwrap());

        let value = env.create_int32(3).unwrap();
        env.throw(&value).unwrap();
        assert_eq!(env.get_and_clear_last_exception().unwrap(), value);

        env.fatal_exception(&value).unwrap();
        assert!(env.is_exception_pending().unwrap());
    }
}
