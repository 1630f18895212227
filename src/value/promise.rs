//! Promises with natively held resolvers.
//!
//! The engine exposes no resolver handles, so `create_promise` runs the
//! global `Promise` constructor with a host executor that captures the
//! `resolve`/`reject` pair. The pair lives on a holder object kept alive by a
//! strong reference until the deferred is settled.

use crate::engine::{Engine, Invocation, NativeCallback};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::reference::Reference;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// Settles one promise; consumed by [`Env::resolve_deferred`] or
/// [`Env::reject_deferred`]
pub struct Deferred<E: Engine> {
    resolvers: Reference<E>,
}

impl<E: Engine> fmt::Debug for Deferred<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolvers", &self.resolvers)
            .finish()
    }
}

impl<E: Engine> Env<E> {
    /// Create a pending promise and the deferred that settles it
    pub fn create_promise(&self) -> Result<(Deferred<E>, E::Value)> {
        self.entry(|| {
            let engine = self.engine();
            let captured: Rc<RefCell<Option<(E::Value, E::Value)>>> = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&captured);
            let capture_resolvers: NativeCallback<E> =
                Rc::new(move |engine: &E, invocation: Invocation<E::Value>| {
                    let mut args = invocation.args.into_iter();
                    let resolve = args.next().unwrap_or_else(|| engine.undefined());
                    let reject = args.next().unwrap_or_else(|| engine.undefined());
                    *slot.borrow_mut() = Some((resolve, reject));
                    Ok(engine.undefined())
                });
            let executor = engine.make_function("executor", capture_resolvers);

            let constructor = self.global_named("Promise")?;
            let promise = self.capture(engine.construct(&constructor, &[executor]))?;
            let (resolve, reject) = captured.borrow_mut().take().ok_or(Error::GenericFailure)?;

            let holder = engine.make_object();
            self.capture(engine.set_property(&holder, &self.name("resolve"), &resolve))?;
            self.capture(engine.set_property(&holder, &self.name("reject"), &reject))?;
            let resolvers = self.new_reference(&holder, 1)?;
            Ok((Deferred { resolvers }, promise))
        })
    }

    fn settle(&self, deferred: Deferred<E>, which: &str, value: &E::Value) -> Result<()> {
        let outcome = deferred
            .resolvers
            .value()
            .ok_or(Error::GenericFailure)
            .and_then(|holder| {
                let settle = self.named_property(&holder, which)?;
                let undefined = self.engine().undefined();
                self.capture(self.engine().call(&settle, &undefined, &[value.clone()]))?;
                Ok(())
            });
        trace!(env = %self.id(), which, "Settled deferred");
        self.drop_reference(deferred.resolvers);
        outcome
    }

    /// Fulfil the deferred's promise with `value`
    pub fn resolve_deferred(&self, deferred: Deferred<E>, value: &E::Value) -> Result<()> {
        self.entry_js(|| self.settle(deferred, "resolve", value))
    }

    /// Reject the deferred's promise with `reason`
    pub fn reject_deferred(&self, deferred: Deferred<E>, reason: &E::Value) -> Result<()> {
        self.entry_js(|| self.settle(deferred, "reject", reason))
    }

    /// `value instanceof Promise`
    pub fn is_promise(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| self.is_instance_of_global(value, "Promise"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::heap::{HeapValue, PromiseState};
    use crate::env::test_support::test_env;

    #[test]
    fn test_resolve_deferred() {
        let (env, _executor) = test_env();
        let (deferred, promise) = env.create_promise().unwrap();
        assert!(env.is_promise(&promise).unwrap());
        assert_eq!(env.engine().promise_state(&promise), Some(PromiseState::Pending));
        assert_eq!(env.strong_refs.borrow().len(), 1);

        let value = env.create_int32(11).unwrap();
        env.resolve_deferred(deferred, &value).unwrap();
        assert_eq!(
            env.engine().promise_state(&promise),
            Some(PromiseState::Fulfilled(HeapValue::Number(11.0)))
        );
        assert!(env.strong_refs.borrow().is_empty());
    }

    #[test]
    fn test_reject_deferred() {
        let (env, _executor) = test_env();
        let (deferred, promise) = env.create_promise().unwrap();
        let message = env.create_string_utf8(b"nope").unwrap();
        let reason = env.create_error(None, &message).unwrap();

        env.reject_deferred(deferred, &reason).unwrap();
        assert_eq!(
            env.engine().promise_state(&promise),
            Some(PromiseState::Rejected(reason))
        );
    }

    #[test]
    fn test_is_promise() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        assert!(!env.is_promise(&object).unwrap());
        assert!(!env.is_promise(&HeapValue::Undefined).unwrap());
    }
}
