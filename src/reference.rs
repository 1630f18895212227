//! References and finalization.
//!
//! A [`Reference`] holds a value with a count. While the count is positive
//! the value is protected from collection and tracked in the environment's
//! strong table; at zero it is weak, and a finalizer registered with the
//! engine's `FinalizationRegistry` clears it once the value is collected.
//! The registry is created lazily, once per environment.

use crate::engine::{utf16, Engine, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::native::Finalizer;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

pub(crate) struct RefState<E: Engine> {
    id: u64,
    value: RefCell<Option<E::Value>>,
    count: Cell<u32>,
    deleted: Rc<Cell<bool>>,
}

impl<E: Engine> RefState<E> {
    /// Drop protection and the stored value; the paired finalizer becomes
    /// a no-op.
    pub(crate) fn deinit(&self, engine: &E) {
        if self.count.replace(0) > 0 {
            if let Some(value) = self.value.borrow().as_ref() {
                engine.unprotect(value);
            }
        }
        self.deleted.set(true);
        self.value.borrow_mut().take();
    }
}

/// Counted handle to an engine value
pub struct Reference<E: Engine> {
    state: Rc<RefState<E>>,
}

impl<E: Engine> Reference<E> {
    /// Current count; zero means weak
    pub fn count(&self) -> u32 {
        self.state.count.get()
    }

    pub(crate) fn value(&self) -> Option<E::Value> {
        self.state.value.borrow().clone()
    }
}

impl<E: Engine> fmt::Debug for Reference<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.state.id)
            .field("count", &self.state.count.get())
            .field("deleted", &self.state.deleted.get())
            .finish()
    }
}

impl<E: Engine> Env<E> {
    /// The environment's finalization registry, created on first use
    fn finalization_registry(&self) -> Result<E::Value> {
        self.registry
            .get_or_try_init(|| {
                let constructor = self.global_named("FinalizationRegistry")?;
                let cleanup = self.make_registry_cleanup()?;
                let registry = self.capture(self.engine().construct(&constructor, &[cleanup]))?;
                self.engine().protect(&registry);
                debug!(env = %self.id(), "Created finalization registry");
                Ok(registry)
            })
            .cloned()
    }

    /// Run `hook` once after `target` is collected
    pub(crate) fn register_finalizer(
        &self,
        target: &E::Value,
        hook: Box<dyn FnOnce()>,
    ) -> Result<()> {
        let registry = self.finalization_registry()?;
        let register = self.capture(
            self.engine()
                .get_property(&registry, &self.engine().string(&utf16("register"))),
        )?;
        let held = self.make_external(std::ptr::null_mut(), Some(Finalizer::Hook(hook)))?;
        self.capture(self.engine().call(&register, &registry, &[target.clone(), held]))?;
        Ok(())
    }

    pub(crate) fn new_reference(
        &self,
        value: &E::Value,
        initial_count: u32,
    ) -> Result<Reference<E>> {
        let kind = self.engine().kind(value);
        if !matches!(kind, ValueKind::Object | ValueKind::Function | ValueKind::Symbol) {
            return Err(Error::InvalidArg);
        }

        let state = Rc::new(RefState {
            id: self.next_id(),
            value: RefCell::new(Some(value.clone())),
            count: Cell::new(initial_count),
            deleted: Rc::new(Cell::new(false)),
        });

        // Symbols are never reported collected
        if kind != ValueKind::Symbol {
            let deleted = Rc::clone(&state.deleted);
            let weak = Rc::downgrade(&state);
            self.register_finalizer(
                value,
                Box::new(move || {
                    if deleted.get() {
                        return;
                    }
                    if let Some(state) = weak.upgrade() {
                        state.value.borrow_mut().take();
                        trace!(reference = state.id, "Weak reference target collected");
                    }
                }),
            )?;
        }

        if initial_count > 0 {
            self.engine().protect(value);
            self.strong_refs
                .borrow_mut()
                .insert(state.id, Rc::clone(&state));
        }
        self.metrics().reference_created();
        Ok(Reference { state })
    }

    pub(crate) fn drop_reference(&self, reference: Reference<E>) {
        let state = reference.state;
        if state.count.get() > 0 {
            self.strong_refs.borrow_mut().remove(&state.id);
        }
        state.deinit(self.engine());
        self.metrics().reference_deleted();
        self.check_empty();
    }

    /// Create a reference with `initial_count`; zero makes it weak.
    ///
    /// Objects, functions and symbols can be referenced.
    pub fn create_reference(&self, value: &E::Value, initial_count: u32) -> Result<Reference<E>> {
        self.entry(|| self.new_reference(value, initial_count))
    }

    /// Increment the count, protecting the value on 0 -> 1.
    ///
    /// Fails when the value was already collected.
    pub fn reference_ref(&self, reference: &Reference<E>) -> Result<u32> {
        self.entry(|| {
            let state = &reference.state;
            let count = state.count.get();
            if count == 0 {
                let value = state.value.borrow().clone().ok_or(Error::GenericFailure)?;
                self.engine().protect(&value);
                self.strong_refs
                    .borrow_mut()
                    .insert(state.id, Rc::clone(state));
                trace!(reference = state.id, "Reference became strong");
            }
            state.count.set(count + 1);
            Ok(count + 1)
        })
    }

    /// Decrement the count, releasing protection on 1 -> 0
    pub fn reference_unref(&self, reference: &Reference<E>) -> Result<u32> {
        self.entry(|| {
            let state = &reference.state;
            let count = state.count.get();
            if count == 0 {
                return Err(Error::GenericFailure);
            }
            state.count.set(count - 1);
            if count == 1 {
                if let Some(value) = state.value.borrow().as_ref() {
                    self.engine().unprotect(value);
                }
                self.strong_refs.borrow_mut().remove(&state.id);
                trace!(reference = state.id, "Reference became weak");
                self.check_empty();
            }
            Ok(count - 1)
        })
    }

    /// Delete a reference. A later collection of its value is ignored.
    pub fn delete_reference(&self, reference: Reference<E>) -> Result<()> {
        self.entry(|| {
            self.drop_reference(reference);
            Ok(())
        })
    }

    /// Referenced value, `None` once it was collected
    pub fn get_reference_value(&self, reference: &Reference<E>) -> Result<Option<E::Value>> {
        self.entry(|| Ok(reference.state.value.borrow().clone()))
    }
}
