//! Native-object records.
//!
//! Functions, constructors, externals and wrapped objects carry a
//! [`NativeRecord`] in the engine's private slot of the object. Records are
//! found again by object identity, never by walking prototypes. A record
//! owns the finalizers attached to its object and runs them exactly once,
//! when the engine reclaims the object or when a finalization-registry
//! cleanup consumes them.

use crate::engine::{utf16, Engine, Invocation, JsResult, NativeCallback, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::reference::Reference;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::fmt;
use std::ops::BitOr;
use std::ptr;
use std::rc::{Rc, Weak};
use tracing::trace;

/// Native callback invoked when script calls a bridged function.
///
/// Returning `None` yields `undefined`.
pub type Callback<E> = fn(&Env<E>, &CallbackInfo<E>) -> Option<<E as Engine>::Value>;

/// Finalizer receiving `(env, data, hint)`
pub type Finalize<E> = fn(&Env<E>, *mut c_void, *mut c_void);

/// Variant of a native-object record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// Class constructor from `define_class`
    Constructor,
    /// Plain function from `create_function`
    Function,
    /// Opaque external value
    External,
    /// Native data attached to an existing object by `wrap`
    Wrapper,
}

pub(crate) enum Finalizer<E: Engine> {
    /// User finalizer, called with the record's current data
    Native {
        callback: Finalize<E>,
        hint: *mut c_void,
    },
    /// Bridge-internal closure
    Hook(Box<dyn FnOnce()>),
}

pub(crate) struct NativeRecord<E: Engine> {
    kind: NativeKind,
    env: Weak<Env<E>>,
    data: Cell<*mut c_void>,
    callback: Option<Callback<E>>,
    finalizers: RefCell<Vec<Finalizer<E>>>,
}

impl<E: Engine> NativeRecord<E> {
    fn new(kind: NativeKind, env: Weak<Env<E>>, data: *mut c_void) -> Self {
        Self {
            kind,
            env,
            data: Cell::new(data),
            callback: None,
            finalizers: RefCell::new(Vec::new()),
        }
    }

    fn with_callback(mut self, callback: Callback<E>) -> Self {
        self.callback = Some(callback);
        self
    }

    fn with_finalizer(self, finalizer: Finalizer<E>) -> Self {
        self.finalizers.borrow_mut().push(finalizer);
        self
    }

    /// Run and discard every pending finalizer
    pub(crate) fn finalize(&self) {
        let finalizers = self.finalizers.take();
        if finalizers.is_empty() {
            return;
        }
        let env = self.env.upgrade();
        trace!(kind = ?self.kind, count = finalizers.len(), "Running native finalizers");
        for finalizer in finalizers {
            match finalizer {
                Finalizer::Native { callback, hint } => {
                    // The environment is already gone during engine teardown
                    if let Some(env) = &env {
                        callback(env, self.data.get(), hint);
                        env.metrics().finalizer_ran();
                    }
                }
                Finalizer::Hook(hook) => hook(),
            }
        }
    }
}

impl<E: Engine> Drop for NativeRecord<E> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Contents of an object's private slot
pub(crate) struct NativeSlot<E: Engine> {
    primary: Option<NativeRecord<E>>,
    wrapper: RefCell<Option<NativeRecord<E>>>,
}

impl<E: Engine> NativeSlot<E> {
    pub(crate) fn of(engine: &E, object: &E::Value) -> Option<Rc<Self>> {
        engine.private(object)?.downcast::<Self>().ok()
    }

    fn primary(&self, kind: NativeKind) -> Option<&NativeRecord<E>> {
        self.primary.as_ref().filter(|record| record.kind == kind)
    }
}

/// Arguments of one native callback invocation
pub struct CallbackInfo<E: Engine> {
    this: E::Value,
    args: Vec<E::Value>,
    new_target: Option<E::Value>,
    data: *mut c_void,
}

impl<E: Engine> CallbackInfo<E> {
    /// Receiver
    pub fn this(&self) -> &E::Value {
        &self.this
    }

    /// Positional arguments
    pub fn args(&self) -> &[E::Value] {
        &self.args
    }

    /// Data pointer supplied when the function was created
    pub fn data(&self) -> *mut c_void {
        self.data
    }
}

impl<E: Engine> fmt::Debug for CallbackInfo<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackInfo")
            .field("this", &self.this)
            .field("args", &self.args)
            .field("new_target", &self.new_target)
            .finish()
    }
}

/// Result of [`Env::get_cb_info`]
#[derive(Debug)]
pub struct CallbackArgs<E: Engine> {
    /// Number of arguments actually passed
    pub argc: usize,
    /// Receiver
    pub this: E::Value,
    /// Data pointer supplied when the function was created
    pub data: *mut c_void,
}

/// Property attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropertyAttributes(u32);

impl PropertyAttributes {
    /// Read-only, non-enumerable, non-configurable
    pub const DEFAULT: Self = Self(0);
    /// Assignable
    pub const WRITABLE: Self = Self(1);
    /// Visible to enumeration
    pub const ENUMERABLE: Self = Self(1 << 1);
    /// Deletable and redefinable
    pub const CONFIGURABLE: Self = Self(1 << 2);
    /// Defined on the constructor by `define_class`
    pub const STATIC: Self = Self(1 << 10);
    /// Writable and configurable
    pub const DEFAULT_METHOD: Self = Self(1 | 1 << 2);
    /// Writable, enumerable and configurable
    pub const DEFAULT_JSPROPERTY: Self = Self(1 | 1 << 1 | 1 << 2);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// From raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PropertyAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One property for [`Env::define_properties`] and [`Env::define_class`]
pub struct PropertyDescriptor<E: Engine> {
    /// Property name as text; takes precedence over `name`
    pub utf8name: Option<String>,
    /// Property name as a string or symbol value
    pub name: Option<E::Value>,
    /// Method body
    pub method: Option<Callback<E>>,
    /// Accessor getter
    pub getter: Option<Callback<E>>,
    /// Accessor setter
    pub setter: Option<Callback<E>>,
    /// Data value
    pub value: Option<E::Value>,
    /// Attribute bits
    pub attributes: PropertyAttributes,
    /// Data pointer handed to method and accessor callbacks
    pub data: *mut c_void,
}

impl<E: Engine> PropertyDescriptor<E> {
    fn named(name: &str) -> Self {
        Self {
            utf8name: Some(name.to_string()),
            name: None,
            method: None,
            getter: None,
            setter: None,
            value: None,
            attributes: PropertyAttributes::DEFAULT,
            data: ptr::null_mut(),
        }
    }

    /// Data property
    pub fn value(name: &str, value: E::Value) -> Self {
        Self {
            value: Some(value),
            attributes: PropertyAttributes::DEFAULT_JSPROPERTY,
            ..Self::named(name)
        }
    }

    /// Method property
    pub fn method(name: &str, method: Callback<E>) -> Self {
        Self {
            method: Some(method),
            attributes: PropertyAttributes::DEFAULT_METHOD,
            ..Self::named(name)
        }
    }

    /// Accessor property
    pub fn accessor(name: &str, getter: Option<Callback<E>>, setter: Option<Callback<E>>) -> Self {
        Self {
            getter,
            setter,
            attributes: PropertyAttributes::CONFIGURABLE,
            ..Self::named(name)
        }
    }

    /// Replace the attribute bits
    pub fn with_attributes(mut self, attributes: PropertyAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set the callback data pointer
    pub fn with_data(mut self, data: *mut c_void) -> Self {
        self.data = data;
        self
    }
}

fn native_entry<E: Engine>() -> NativeCallback<E> {
    Rc::new(invoke::<E>)
}

/// Engine-facing trampoline shared by every bridged function
fn invoke<E: Engine>(engine: &E, invocation: Invocation<E::Value>) -> JsResult<E::Value, E::Value> {
    let Some(slot) = NativeSlot::<E>::of(engine, &invocation.callee) else {
        return Ok(engine.undefined());
    };
    let Some(record) = slot.primary.as_ref() else {
        return Ok(engine.undefined());
    };
    let (Some(callback), Some(env)) = (record.callback, record.env.upgrade()) else {
        return Ok(engine.undefined());
    };

    env.clear_last_error();
    let info = CallbackInfo {
        this: invocation.this,
        args: invocation.args,
        new_target: invocation.new_target,
        data: record.data.get(),
    };
    let result = callback(&env, &info);

    if let Some(exception) = env.take_exception() {
        return Err(exception);
    }
    Ok(result.unwrap_or_else(|| engine.undefined()))
}

/// Cleanup callback of the finalization registry: runs the finalizers held
/// by the external passed as the registration's held value.
fn run_registry_cleanup<E: Engine>(env: &Env<E>, info: &CallbackInfo<E>) -> Option<E::Value> {
    let held = info.args.first()?;
    let slot = NativeSlot::<E>::of(env.engine(), held)?;
    if let Some(record) = slot.primary(NativeKind::External) {
        record.finalize();
    }
    None
}

impl<E: Engine> Env<E> {
    fn attach(&self, object: &E::Value, slot: NativeSlot<E>) -> Result<()> {
        if self.engine().set_private(object, Rc::new(slot)) {
            Ok(())
        } else {
            Err(Error::ObjectExpected)
        }
    }

    fn attach_primary(&self, object: &E::Value, record: NativeRecord<E>) -> Result<()> {
        self.attach(
            object,
            NativeSlot {
                primary: Some(record),
                wrapper: RefCell::new(None),
            },
        )
    }

    pub(crate) fn make_function(
        &self,
        name: &str,
        callback: Callback<E>,
        data: *mut c_void,
    ) -> Result<E::Value> {
        let function = self.engine().make_function(name, native_entry());
        let record =
            NativeRecord::new(NativeKind::Function, self.downgrade(), data).with_callback(callback);
        self.attach_primary(&function, record)?;
        Ok(function)
    }

    /// Create a function that runs `callback` when called
    pub fn create_function(
        &self,
        name: &str,
        callback: Callback<E>,
        data: *mut c_void,
    ) -> Result<E::Value> {
        self.entry(|| self.make_function(name, callback, data))
    }

    /// Create a class constructor.
    ///
    /// Descriptors flagged [`PropertyAttributes::STATIC`] land on the
    /// constructor, the rest on `constructor.prototype`.
    pub fn define_class(
        &self,
        name: &str,
        constructor: Callback<E>,
        data: *mut c_void,
        properties: &[PropertyDescriptor<E>],
    ) -> Result<E::Value> {
        self.entry_js(|| {
            let class = self.engine().make_constructor(name, native_entry());
            let record = NativeRecord::new(NativeKind::Constructor, self.downgrade(), data)
                .with_callback(constructor);
            self.attach_primary(&class, record)?;

            let prototype = self.capture(
                self.engine()
                    .get_property(&class, &self.engine().string(&utf16("prototype"))),
            )?;
            let (statics, instance): (Vec<_>, Vec<_>) = properties
                .iter()
                .partition(|p| p.attributes.contains(PropertyAttributes::STATIC));
            self.define_all(&class, &statics)?;
            self.define_all(&prototype, &instance)?;
            Ok(class)
        })
    }

    /// Define `properties` on `object`
    pub fn define_properties(
        &self,
        object: &E::Value,
        properties: &[PropertyDescriptor<E>],
    ) -> Result<()> {
        self.entry_js(|| {
            self.expect_object(object)?;
            let properties: Vec<_> = properties.iter().collect();
            self.define_all(object, &properties)
        })
    }

    fn define_all(&self, object: &E::Value, properties: &[&PropertyDescriptor<E>]) -> Result<()> {
        if properties.is_empty() {
            return Ok(());
        }
        let engine = self.engine();
        let object_constructor = self.global_named("Object")?;
        let define = self.named_property(&object_constructor, "defineProperty")?;

        for property in properties {
            let key = self.descriptor_key(property)?;
            let label = property.utf8name.as_deref().unwrap_or("");
            let attributes = property.attributes;
            let descriptor = engine.make_object();
            let field = |name: &str, value: E::Value| {
                self.capture(engine.set_property(&descriptor, &engine.string(&utf16(name)), &value))
            };

            if property.getter.is_some() || property.setter.is_some() {
                if let Some(getter) = property.getter {
                    field("get", self.make_function(label, getter, property.data)?)?;
                }
                if let Some(setter) = property.setter {
                    field("set", self.make_function(label, setter, property.data)?)?;
                }
            } else {
                let value = match (property.method, &property.value) {
                    (Some(method), _) => self.make_function(label, method, property.data)?,
                    (None, Some(value)) => value.clone(),
                    (None, None) => return Err(Error::InvalidArg),
                };
                field("value", value)?;
                field(
                    "writable",
                    engine.boolean(attributes.contains(PropertyAttributes::WRITABLE)),
                )?;
            }
            field(
                "enumerable",
                engine.boolean(attributes.contains(PropertyAttributes::ENUMERABLE)),
            )?;
            field(
                "configurable",
                engine.boolean(attributes.contains(PropertyAttributes::CONFIGURABLE)),
            )?;

            self.capture(engine.call(
                &define,
                &object_constructor,
                &[object.clone(), key, descriptor],
            ))?;
        }
        Ok(())
    }

    fn descriptor_key(&self, property: &PropertyDescriptor<E>) -> Result<E::Value> {
        if let Some(name) = &property.utf8name {
            return Ok(self.engine().string(&utf16(name)));
        }
        match &property.name {
            Some(name) => match self.engine().kind(name) {
                ValueKind::String | ValueKind::Symbol => Ok(name.clone()),
                _ => Err(Error::NameExpected),
            },
            None => Err(Error::NameExpected),
        }
    }

    /// Copy up to `argv.len()` arguments into `argv`, padding with
    /// `undefined`, and return the real argument count.
    pub fn get_cb_info(
        &self,
        info: &CallbackInfo<E>,
        argv: &mut [E::Value],
    ) -> Result<CallbackArgs<E>> {
        self.entry(|| {
            let undefined = self.engine().undefined();
            for (i, slot) in argv.iter_mut().enumerate() {
                *slot = info.args.get(i).cloned().unwrap_or_else(|| undefined.clone());
            }
            Ok(CallbackArgs {
                argc: info.args.len(),
                this: info.this.clone(),
                data: info.data,
            })
        })
    }

    /// Constructor invoked with `new`, `None` for plain calls
    pub fn get_new_target(&self, info: &CallbackInfo<E>) -> Result<Option<E::Value>> {
        self.entry(|| Ok(info.new_target.clone()))
    }

    pub(crate) fn make_external(
        &self,
        data: *mut c_void,
        finalizer: Option<Finalizer<E>>,
    ) -> Result<E::Value> {
        let external = self.engine().make_object();
        let mut record = NativeRecord::new(NativeKind::External, self.downgrade(), data);
        if let Some(finalizer) = finalizer {
            record = record.with_finalizer(finalizer);
        }
        self.attach_primary(&external, record)?;
        Ok(external)
    }

    /// Create an opaque value carrying `data`
    pub fn create_external(
        &self,
        data: *mut c_void,
        finalize: Option<Finalize<E>>,
        hint: *mut c_void,
    ) -> Result<E::Value> {
        self.entry(|| {
            let finalizer = finalize.map(|callback| Finalizer::Native { callback, hint });
            self.make_external(data, finalizer)
        })
    }

    /// Data pointer of an external
    pub fn get_value_external(&self, value: &E::Value) -> Result<*mut c_void> {
        self.entry(|| {
            NativeSlot::of(self.engine(), value)
                .and_then(|slot| slot.primary(NativeKind::External).map(|r| r.data.get()))
                .ok_or(Error::InvalidArg)
        })
    }

    pub(crate) fn native_kind(&self, value: &E::Value) -> Option<NativeKind> {
        NativeSlot::<E>::of(self.engine(), value)?
            .primary
            .as_ref()
            .map(|record| record.kind)
    }

    /// Attach native data to an existing object.
    ///
    /// With `want_ref` a weak reference to the object is returned; that
    /// requires a finalizer.
    pub fn wrap(
        &self,
        object: &E::Value,
        data: *mut c_void,
        finalize: Option<Finalize<E>>,
        hint: *mut c_void,
        want_ref: bool,
    ) -> Result<Option<Reference<E>>> {
        self.entry(|| {
            self.expect_object(object)?;
            if want_ref && finalize.is_none() {
                return Err(Error::InvalidArg);
            }
            let finalizer = finalize.map(|callback| Finalizer::Native { callback, hint });

            match NativeSlot::<E>::of(self.engine(), object) {
                Some(slot) => {
                    let mut wrapper = slot.wrapper.borrow_mut();
                    match wrapper.as_ref() {
                        Some(record) if !record.data.get().is_null() => {
                            return Err(Error::InvalidArg)
                        }
                        // Rewrapping after remove_wrap reuses the record
                        Some(record) => {
                            record.data.set(data);
                            record.finalizers.borrow_mut().extend(finalizer);
                        }
                        None => {
                            let mut record =
                                NativeRecord::new(NativeKind::Wrapper, self.downgrade(), data);
                            record.finalizers.get_mut().extend(finalizer);
                            *wrapper = Some(record);
                        }
                    }
                }
                None => {
                    let mut record = NativeRecord::new(NativeKind::Wrapper, self.downgrade(), data);
                    record.finalizers.get_mut().extend(finalizer);
                    self.attach(
                        object,
                        NativeSlot {
                            primary: None,
                            wrapper: RefCell::new(Some(record)),
                        },
                    )?;
                }
            }

            if want_ref {
                Ok(Some(self.new_reference(object, 0)?))
            } else {
                Ok(None)
            }
        })
    }

    fn wrapped(&self, object: &E::Value) -> Result<Rc<NativeSlot<E>>> {
        self.expect_object(object)?;
        let slot = NativeSlot::<E>::of(self.engine(), object).ok_or(Error::InvalidArg)?;
        let wrapped = slot
            .wrapper
            .borrow()
            .as_ref()
            .is_some_and(|record| !record.data.get().is_null());
        if wrapped {
            Ok(slot)
        } else {
            Err(Error::InvalidArg)
        }
    }

    /// Native data attached by [`Env::wrap`]
    pub fn unwrap(&self, object: &E::Value) -> Result<*mut c_void> {
        self.entry(|| {
            let slot = self.wrapped(object)?;
            let data = slot
                .wrapper
                .borrow()
                .as_ref()
                .map_or(ptr::null_mut(), |record| record.data.get());
            Ok(data)
        })
    }

    /// Detach native data. The record and its finalizers stay attached.
    pub fn remove_wrap(&self, object: &E::Value) -> Result<*mut c_void> {
        self.entry(|| {
            let slot = self.wrapped(object)?;
            let data = slot
                .wrapper
                .borrow()
                .as_ref()
                .map_or(ptr::null_mut(), |record| record.data.replace(ptr::null_mut()));
            Ok(data)
        })
    }

    /// Run `finalize(env, data, hint)` once `object` is collected
    pub fn add_finalizer(
        &self,
        object: &E::Value,
        data: *mut c_void,
        finalize: Finalize<E>,
        hint: *mut c_void,
        want_ref: bool,
    ) -> Result<Option<Reference<E>>> {
        self.entry(|| {
            self.expect_object(object)?;
            let env = self.downgrade();
            self.register_finalizer(
                object,
                Box::new(move || {
                    if let Some(env) = env.upgrade() {
                        finalize(&env, data, hint);
                        env.metrics().finalizer_ran();
                    }
                }),
            )?;
            if want_ref {
                Ok(Some(self.new_reference(object, 0)?))
            } else {
                Ok(None)
            }
        })
    }

    /// Registry cleanup callback bound to this environment
    pub(crate) fn make_registry_cleanup(&self) -> Result<E::Value> {
        self.make_function("cleanup", run_registry_cleanup::<E>, ptr::null_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::heap::{HeapEngine, HeapValue};
    use crate::env::test_support::test_env;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestEnv = Env<HeapEngine>;

    fn add(env: &TestEnv, info: &CallbackInfo<HeapEngine>) -> Option<HeapValue> {
        let mut argv = vec![HeapValue::Undefined; 2];
        let args = env.get_cb_info(info, &mut argv).ok()?;
        assert_eq!(args.argc, 2);
        assert_eq!(args.data as usize, 7);
        let a = env.get_value_double(&argv[0]).ok()?;
        let b = env.get_value_double(&argv[1]).ok()?;
        env.create_double(a + b).ok()
    }

    fn thrower(env: &TestEnv, _info: &CallbackInfo<HeapEngine>) -> Option<HeapValue> {
        env.throw_error(Some("E_TEST"), "from native").ok()?;
        None
    }

    fn construct_point(env: &TestEnv, info: &CallbackInfo<HeapEngine>) -> Option<HeapValue> {
        let target = env.get_new_target(info).ok()?;
        assert!(target.is_some());
        let x = info.args().first().cloned().unwrap_or(HeapValue::Undefined);
        env.set_named_property(info.this(), "x", &x).ok()?;
        None
    }

    fn get_answer(env: &TestEnv, _info: &CallbackInfo<HeapEngine>) -> Option<HeapValue> {
        env.create_int32(42).ok()
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    fn record_finalize(_env: &TestEnv, _data: *mut c_void, hint: *mut c_void) {
        FINALIZED.fetch_add(hint as usize, Ordering::SeqCst);
    }

    #[test]
    fn test_function_sees_arguments() {
        let (env, _executor) = test_env();
        let function = env.create_function("add", add, 7 as *mut c_void).unwrap();
        let a = env.create_double(1.5).unwrap();
        let b = env.create_double(2.0).unwrap();
        let receiver = env.get_global().unwrap();

        let result = env.call_function(&receiver, &function, &[a, b]).unwrap();
        assert_eq!(env.get_value_double(&result).unwrap(), 3.5);
    }

    #[test]
    fn test_get_cb_info_pads_and_truncates() {
        fn first_only(env: &TestEnv, info: &CallbackInfo<HeapEngine>) -> Option<HeapValue> {
            let mut argv = vec![HeapValue::Null; 3];
            let args = env.get_cb_info(info, &mut argv).ok()?;
            assert_eq!(args.argc, 1);
            assert_eq!(argv[1], HeapValue::Undefined);
            assert_eq!(argv[2], HeapValue::Undefined);
            Some(argv[0].clone())
        }

        let (env, _executor) = test_env();
        let function = env
            .create_function("first", first_only, ptr::null_mut())
            .unwrap();
        let undefined = env.get_undefined().unwrap();
        let arg = env.create_int32(9).unwrap();
        let result = env.call_function(&undefined, &function, &[arg]).unwrap();
        assert_eq!(result, HeapValue::Number(9.0));
    }

    #[test]
    fn test_callback_exception_propagates() {
        let (env, _executor) = test_env();
        let function = env
            .create_function("thrower", thrower, ptr::null_mut())
            .unwrap();
        let undefined = env.get_undefined().unwrap();

        assert_eq!(
            env.call_function(&undefined, &function, &[]),
            Err(Error::PendingException)
        );
        let error = env.get_and_clear_last_exception().unwrap();
        assert!(env.is_error(&error).unwrap());
        let code = env.get_named_property(&error, "code").unwrap();
        assert_eq!(code, HeapValue::string("E_TEST"));
    }

    #[test]
    fn test_define_class() {
        let (env, _executor) = test_env();
        let properties = [
            PropertyDescriptor::<HeapEngine>::accessor("answer", Some(get_answer), None),
            PropertyDescriptor::<HeapEngine>::value("origin", HeapValue::Number(0.0))
                .with_attributes(PropertyAttributes::STATIC),
        ];
        let class = env
            .define_class("Point", construct_point, ptr::null_mut(), &properties)
            .unwrap();

        let x = env.create_double(3.0).unwrap();
        let point = env.new_instance(&class, &[x]).unwrap();
        assert!(env.instanceof(&point, &class).unwrap());
        assert_eq!(
            env.get_named_property(&point, "x").unwrap(),
            HeapValue::Number(3.0)
        );
        assert_eq!(
            env.get_named_property(&point, "answer").unwrap(),
            HeapValue::Number(42.0)
        );
        assert_eq!(
            env.get_named_property(&class, "origin").unwrap(),
            HeapValue::Number(0.0)
        );
        assert!(!env.has_own_property(&point, &HeapValue::string("answer")).unwrap());
    }

    #[test]
    fn test_define_properties_attributes() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let properties = [
            PropertyDescriptor::<HeapEngine>::value("hidden", HeapValue::Number(1.0))
                .with_attributes(PropertyAttributes::WRITABLE),
            PropertyDescriptor::<HeapEngine>::value("shown", HeapValue::Number(2.0))
                .with_attributes(PropertyAttributes::ENUMERABLE),
            PropertyDescriptor::<HeapEngine>::method("answer", get_answer),
        ];
        env.define_properties(&object, &properties).unwrap();

        let names = env.get_property_names(&object).unwrap();
        assert_eq!(env.get_array_length(&names).unwrap(), 1);
        assert_eq!(
            env.get_element(&names, 0).unwrap(),
            HeapValue::string("shown")
        );

        let method = env.get_named_property(&object, "answer").unwrap();
        let result = env.call_function(&object, &method, &[]).unwrap();
        assert_eq!(result, HeapValue::Number(42.0));
    }

    #[test]
    fn test_define_property_requires_value() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let empty = PropertyDescriptor::<HeapEngine>::value("x", HeapValue::Undefined);
        let empty = PropertyDescriptor { value: None, ..empty };
        assert_eq!(env.define_properties(&object, &[empty]), Err(Error::InvalidArg));

        let unnamed = PropertyDescriptor {
            utf8name: None,
            name: Some(HeapValue::Number(1.0)),
            ..PropertyDescriptor::<HeapEngine>::value("x", HeapValue::Null)
        };
        assert_eq!(env.define_properties(&object, &[unnamed]), Err(Error::NameExpected));
    }

    #[test]
    fn test_external_round_trip() {
        let (env, _executor) = test_env();
        let external = env
            .create_external(0x1234 as *mut c_void, None, ptr::null_mut())
            .unwrap();
        assert_eq!(env.get_value_external(&external).unwrap() as usize, 0x1234);
        assert_eq!(
            env.type_of(&external).unwrap(),
            crate::value::ValueType::External
        );

        let plain = env.create_object().unwrap();
        assert_eq!(env.get_value_external(&plain), Err(Error::InvalidArg));
    }

    #[test]
    fn test_wrap_unwrap_remove() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        env.wrap(&object, 11 as *mut c_void, None, ptr::null_mut(), false).unwrap();
        assert_eq!(env.unwrap(&object).unwrap() as usize, 11);

        assert!(matches!(
            env.wrap(&object, 12 as *mut c_void, None, ptr::null_mut(), false),
            Err(Error::InvalidArg)
        ));

        assert_eq!(env.remove_wrap(&object).unwrap() as usize, 11);
        assert_eq!(env.unwrap(&object), Err(Error::InvalidArg));
        assert_eq!(env.remove_wrap(&object), Err(Error::InvalidArg));

        // The record survives, so wrapping again is allowed
        env.wrap(&object, 13 as *mut c_void, None, ptr::null_mut(), false)
            .unwrap();
        assert_eq!(env.unwrap(&object).unwrap() as usize, 13);
    }

    #[test]
    fn test_wrap_ref_requires_finalizer() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        assert!(matches!(
            env.wrap(&object, 1 as *mut c_void, None, ptr::null_mut(), true),
            Err(Error::InvalidArg)
        ));
    }

    #[test]
    fn test_wrap_finalizer_runs_on_collect() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let reference = env
            .wrap(
                &object,
                21 as *mut c_void,
                Some(record_finalize),
                1000 as *mut c_void,
                true,
            )
            .unwrap()
            .unwrap();
        assert_eq!(reference.count(), 0);

        let before = FINALIZED.load(Ordering::SeqCst);
        env.engine().collect();
        assert!(FINALIZED.load(Ordering::SeqCst) - before >= 1000);
        assert_eq!(env.get_reference_value(&reference).unwrap(), None);
        env.delete_reference(reference).unwrap();
    }

    #[test]
    fn test_add_finalizer_runs_once() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        env.add_finalizer(
            &object,
            31 as *mut c_void,
            record_finalize,
            1 as *mut c_void,
            false,
        )
        .unwrap();

        let finalizers_before = env.metrics().snapshot().finalizers_run;
        env.engine().collect();
        env.engine().collect();
        assert_eq!(env.metrics().snapshot().finalizers_run - finalizers_before, 1);
    }

    static SAW_CLEARED: AtomicUsize = AtomicUsize::new(0);

    type Slot = RefCell<Option<Reference<HeapEngine>>>;

    fn check_reference_cleared(env: &TestEnv, data: *mut c_void, _hint: *mut c_void) {
        // SAFETY: the test leaks the slot for the whole run
        let slot = unsafe { &*(data as *const Slot) };
        if let Some(reference) = slot.borrow().as_ref() {
            if env.get_reference_value(reference) == Ok(None) {
                SAW_CLEARED.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_weak_reference_cleared_before_wrap_finalizer() {
        let (env, _executor) = test_env();
        let slot: &'static Slot = Box::leak(Box::new(RefCell::new(None)));
        let object = env.create_object().unwrap();
        let reference = env
            .wrap(
                &object,
                slot as *const Slot as *mut c_void,
                Some(check_reference_cleared),
                ptr::null_mut(),
                true,
            )
            .unwrap();
        *slot.borrow_mut() = reference;

        let before = SAW_CLEARED.load(Ordering::SeqCst);
        env.engine().collect();
        assert_eq!(SAW_CLEARED.load(Ordering::SeqCst) - before, 1);
    }

    static TORN_DOWN: AtomicUsize = AtomicUsize::new(0);

    fn record_teardown(_env: &TestEnv, _data: *mut c_void, hint: *mut c_void) {
        TORN_DOWN.fetch_add(hint as usize, Ordering::SeqCst);
    }

    #[test]
    fn test_env_delete_runs_remaining_finalizers() {
        let (env, _executor) = test_env();
        let wrapped = env.create_object().unwrap();
        env.wrap(&wrapped, 5 as *mut c_void, Some(record_teardown), 1 as *mut c_void, false)
            .unwrap();

        let external = env
            .create_external(6 as *mut c_void, Some(record_teardown), 10 as *mut c_void)
            .unwrap();
        let strong = env.create_reference(&external, 1).unwrap();

        let watched = env.create_object().unwrap();
        env.add_finalizer(&watched, ptr::null_mut(), record_teardown, 100 as *mut c_void, false)
            .unwrap();

        let bytes = Box::into_raw(Box::new([0u8; 8])) as *mut u8;
        let buffer = env
            .create_external_arraybuffer(bytes, 8, Some(record_teardown), 1000 as *mut c_void)
            .unwrap();
        let global = env.get_global().unwrap();
        env.set_named_property(&global, "buffer", &buffer).unwrap();

        let metrics = std::sync::Arc::clone(env.metrics());
        let before = metrics.snapshot().finalizers_run;
        Env::delete(env);

        assert_eq!(TORN_DOWN.load(Ordering::SeqCst), 1111);
        assert_eq!(metrics.snapshot().finalizers_run - before, 4);
        assert_eq!(strong.count(), 0);
    }

    #[test]
    fn test_property_attribute_bits() {
        let attributes = PropertyAttributes::WRITABLE | PropertyAttributes::STATIC;
        assert!(attributes.contains(PropertyAttributes::STATIC));
        assert!(!attributes.contains(PropertyAttributes::ENUMERABLE));
        assert_eq!(PropertyAttributes::DEFAULT_JSPROPERTY.bits(), 7);
        assert_eq!(PropertyAttributes::from_bits(1 << 10), PropertyAttributes::STATIC);
    }
}
