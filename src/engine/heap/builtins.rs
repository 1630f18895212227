//! Global scope of the heap engine.
//!
//! Only the intrinsics the bridge reaches through the global object are
//! provided, with the argument checks and exception types scripts observe.

use super::{
    Descriptor, ErrorKind, Heap, HeapEngine, HeapValue, Object, ObjectKind, ObjectRef,
    PromiseState, Property, PropertyKey, RegistryCell,
};
use crate::engine::{Engine, Invocation, JsResult, NativeCallback, ValueKind};
use std::rc::Rc;

type Builtin = fn(&HeapEngine, Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue>;

pub(crate) struct Intrinsics {
    pub(crate) global: ObjectRef,
    pub(crate) object_prototype: ObjectRef,
    pub(crate) function_prototype: ObjectRef,
    pub(crate) array_prototype: ObjectRef,
    pub(crate) error_prototype: ObjectRef,
    pub(crate) type_error_prototype: ObjectRef,
    pub(crate) range_error_prototype: ObjectRef,
    pub(crate) syntax_error_prototype: ObjectRef,
    pub(crate) date_prototype: ObjectRef,
    pub(crate) promise_prototype: ObjectRef,
    pub(crate) weak_map_prototype: ObjectRef,
    pub(crate) registry_prototype: ObjectRef,
    pub(crate) array_buffer_prototype: ObjectRef,
    pub(crate) typed_array_prototype: ObjectRef,
    pub(crate) data_view_prototype: ObjectRef,
}

impl Intrinsics {
    pub(crate) fn roots(&self) -> Vec<ObjectRef> {
        vec![
            self.global,
            self.object_prototype,
            self.function_prototype,
            self.array_prototype,
            self.error_prototype,
            self.type_error_prototype,
            self.range_error_prototype,
            self.syntax_error_prototype,
            self.date_prototype,
            self.promise_prototype,
            self.weak_map_prototype,
            self.registry_prototype,
            self.array_buffer_prototype,
            self.typed_array_prototype,
            self.data_view_prototype,
        ]
    }
}

struct Installer<'a> {
    heap: &'a mut Heap,
    global: ObjectRef,
    function_prototype: ObjectRef,
}

impl Installer<'_> {
    fn prototype(&mut self, parent: ObjectRef) -> ObjectRef {
        self.heap
            .alloc(Object::new(ObjectKind::Ordinary, Some(parent)))
    }

    fn function(&mut self, name: &str, constructor: bool, body: Builtin) -> ObjectRef {
        let callback: NativeCallback<HeapEngine> = Rc::new(body);
        self.heap
            .function(self.function_prototype, name, callback, constructor, Vec::new())
    }

    fn method(&mut self, target: ObjectRef, name: &str, body: Builtin) {
        let function = self.function(name, false, body);
        self.heap.define(
            target,
            PropertyKey::named(name),
            Property::hidden(HeapValue::Object(function)),
        );
    }

    fn value(&mut self, target: ObjectRef, name: &str, value: HeapValue) {
        self.heap
            .define(target, PropertyKey::named(name), Property::hidden(value));
    }

    /// Global constructor wired to `prototype`
    fn class(&mut self, name: &str, prototype: ObjectRef, body: Builtin) -> ObjectRef {
        let constructor = self.function(name, true, body);
        self.heap.define(
            constructor,
            PropertyKey::named("prototype"),
            Property::data(HeapValue::Object(prototype), false, false, false),
        );
        self.value(prototype, "constructor", HeapValue::Object(constructor));
        self.value(self.global, name, HeapValue::Object(constructor));
        constructor
    }

    fn error_prototype(&mut self, parent: ObjectRef, name: &str) -> ObjectRef {
        let prototype = self.prototype(parent);
        self.value(prototype, "name", HeapValue::string(name));
        self.value(prototype, "message", HeapValue::string(""));
        prototype
    }
}

pub(crate) fn install(heap: &mut Heap) -> Intrinsics {
    let object_prototype = heap.alloc(Object::new(ObjectKind::Ordinary, None));
    let function_prototype = heap.alloc(Object::new(ObjectKind::Ordinary, Some(object_prototype)));
    let global = heap.alloc(Object::new(ObjectKind::Ordinary, Some(object_prototype)));

    let mut installer = Installer {
        heap,
        global,
        function_prototype,
    };
    installer.value(global, "globalThis", HeapValue::Object(global));

    let object = installer.class("Object", object_prototype, object_constructor);
    installer.method(object, "getOwnPropertyNames", get_own_property_names);
    installer.method(object, "getOwnPropertySymbols", get_own_property_symbols);
    installer.method(object, "getOwnPropertyDescriptor", get_own_property_descriptor);
    installer.method(object, "defineProperty", define_property);
    installer.method(object, "getPrototypeOf", get_prototype_of);
    installer.method(object, "freeze", freeze);
    installer.method(object, "seal", seal);
    installer.method(object_prototype, "hasOwnProperty", has_own_property);

    let array_prototype = installer.prototype(object_prototype);

    let error_prototype = installer.error_prototype(object_prototype, "Error");
    let type_error_prototype = installer.error_prototype(error_prototype, "TypeError");
    let range_error_prototype = installer.error_prototype(error_prototype, "RangeError");
    let syntax_error_prototype = installer.error_prototype(error_prototype, "SyntaxError");
    installer.class("Error", error_prototype, error_constructor);
    installer.class("TypeError", type_error_prototype, type_error_constructor);
    installer.class("RangeError", range_error_prototype, range_error_constructor);
    installer.class("SyntaxError", syntax_error_prototype, syntax_error_constructor);

    let symbol = installer.function("Symbol", false, symbol_function);
    installer.value(global, "Symbol", HeapValue::Object(symbol));
    let bigint = installer.function("BigInt", false, bigint_function);
    installer.value(global, "BigInt", HeapValue::Object(bigint));

    let date_prototype = installer.prototype(object_prototype);
    installer.class("Date", date_prototype, date_constructor);

    let promise_prototype = installer.prototype(object_prototype);
    installer.class("Promise", promise_prototype, promise_constructor);

    let weak_map_prototype = installer.prototype(object_prototype);
    installer.class("WeakMap", weak_map_prototype, weak_map_constructor);
    installer.method(weak_map_prototype, "get", weak_map_get);
    installer.method(weak_map_prototype, "set", weak_map_set);
    installer.method(weak_map_prototype, "has", weak_map_has);
    installer.method(weak_map_prototype, "delete", weak_map_delete);

    let registry_prototype = installer.prototype(object_prototype);
    installer.class("FinalizationRegistry", registry_prototype, registry_constructor);
    installer.method(registry_prototype, "register", registry_register);

    let array_buffer_prototype = installer.prototype(object_prototype);
    installer.class("ArrayBuffer", array_buffer_prototype, array_buffer_constructor);
    let typed_array_prototype = installer.prototype(object_prototype);

    let data_view_prototype = installer.prototype(object_prototype);
    installer.class("DataView", data_view_prototype, data_view_constructor);

    Intrinsics {
        global,
        object_prototype,
        function_prototype,
        array_prototype,
        error_prototype,
        type_error_prototype,
        range_error_prototype,
        syntax_error_prototype,
        date_prototype,
        promise_prototype,
        weak_map_prototype,
        registry_prototype,
        array_buffer_prototype,
        typed_array_prototype,
        data_view_prototype,
    }
}

fn arg(inv: &Invocation<HeapValue>, index: usize) -> HeapValue {
    inv.args.get(index).cloned().unwrap_or(HeapValue::Undefined)
}

fn require_new(
    engine: &HeapEngine,
    inv: &Invocation<HeapValue>,
    name: &str,
) -> JsResult<(), HeapValue> {
    match inv.new_target {
        Some(_) => Ok(()),
        None => Err(engine.throw(
            ErrorKind::Type,
            &format!("Constructor {} requires 'new'", name),
        )),
    }
}

fn object_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    match arg(&inv, 0) {
        HeapValue::Undefined | HeapValue::Null => Ok(engine.make_object()),
        value => engine.to_object(&value),
    }
}

fn own_keys_array(
    engine: &HeapEngine,
    inv: &Invocation<HeapValue>,
    symbols: bool,
) -> JsResult<HeapValue, HeapValue> {
    let target = engine.to_object(&arg(inv, 0))?;
    let keys: Vec<HeapValue> = engine
        .own_keys(&target)
        .into_iter()
        .filter(|key| matches!(key, PropertyKey::Symbol(_)) == symbols)
        .map(|key| key.to_value())
        .collect();
    Ok(engine.make_array(&keys))
}

fn get_own_property_names(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    own_keys_array(engine, &inv, false)
}

fn get_own_property_symbols(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    own_keys_array(engine, &inv, true)
}

fn get_own_property_descriptor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let target = engine.to_object(&arg(&inv, 0))?;
    let key = engine.property_key(&arg(&inv, 1))?;
    let Some(property) = engine.own_property(&target, &key) else {
        return Ok(HeapValue::Undefined);
    };

    let descriptor = engine.make_object();
    let field = |name: &str, value: HeapValue| {
        engine.set_with_key(&descriptor, &PropertyKey::named(name), &value)
    };
    match property.value {
        super::PropertyValue::Data { value, writable } => {
            field("value", value)?;
            field("writable", HeapValue::Bool(writable))?;
        }
        super::PropertyValue::Accessor { get, set } => {
            field("get", get)?;
            field("set", set)?;
        }
    }
    field("enumerable", HeapValue::Bool(property.enumerable))?;
    field("configurable", HeapValue::Bool(property.configurable))?;
    Ok(descriptor)
}

fn to_descriptor(engine: &HeapEngine, object: &HeapValue) -> JsResult<Descriptor, HeapValue> {
    let field = |name: &str| -> JsResult<Option<HeapValue>, HeapValue> {
        let key = PropertyKey::named(name);
        if engine.has_property(object, &key.to_value())? {
            engine.get_with_key(object, &key).map(Some)
        } else {
            Ok(None)
        }
    };

    let descriptor = Descriptor {
        value: field("value")?,
        writable: field("writable")?.map(|v| engine.to_boolean(&v)),
        get: field("get")?,
        set: field("set")?,
        enumerable: field("enumerable")?.map(|v| engine.to_boolean(&v)),
        configurable: field("configurable")?.map(|v| engine.to_boolean(&v)),
    };

    for accessor in [&descriptor.get, &descriptor.set].into_iter().flatten() {
        if !matches!(accessor, HeapValue::Undefined) && !engine.is_callable(accessor) {
            return Err(engine.throw(ErrorKind::Type, "Getter or setter must be a function"));
        }
    }
    if descriptor.is_accessor() && (descriptor.value.is_some() || descriptor.writable.is_some()) {
        return Err(engine.throw(
            ErrorKind::Type,
            "Invalid property descriptor. Cannot both specify accessors and a value or writable attribute",
        ));
    }
    Ok(descriptor)
}

fn define_property(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let target = arg(&inv, 0);
    if !matches!(target, HeapValue::Object(_)) {
        return Err(engine.throw(ErrorKind::Type, "Object.defineProperty called on non-object"));
    }
    let attributes = arg(&inv, 2);
    if !matches!(attributes, HeapValue::Object(_)) {
        return Err(engine.throw(ErrorKind::Type, "Property description must be an object"));
    }
    let key = engine.property_key(&arg(&inv, 1))?;
    let descriptor = to_descriptor(engine, &attributes)?;
    engine.define_own(&target, key, descriptor)?;
    Ok(target)
}

fn get_prototype_of(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let target = engine.to_object(&arg(&inv, 0))?;
    Ok(engine.prototype(&target))
}

fn freeze(engine: &HeapEngine, inv: Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue> {
    let target = arg(&inv, 0);
    engine.set_integrity(&target, true);
    Ok(target)
}

fn seal(engine: &HeapEngine, inv: Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue> {
    let target = arg(&inv, 0);
    engine.set_integrity(&target, false);
    Ok(target)
}

fn has_own_property(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let key = engine.property_key(&arg(&inv, 0))?;
    let target = engine.to_object(&inv.this)?;
    Ok(HeapValue::Bool(engine.own_property(&target, &key).is_some()))
}

fn construct_error(
    engine: &HeapEngine,
    inv: &Invocation<HeapValue>,
    kind: ErrorKind,
) -> JsResult<HeapValue, HeapValue> {
    let message = match arg(inv, 0) {
        HeapValue::Undefined => None,
        value => Some(engine.to_string(&value)?),
    };
    Ok(engine.make_error(kind, message.as_deref()))
}

fn error_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    construct_error(engine, &inv, ErrorKind::Error)
}

fn type_error_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    construct_error(engine, &inv, ErrorKind::Type)
}

fn range_error_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    construct_error(engine, &inv, ErrorKind::Range)
}

fn syntax_error_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    construct_error(engine, &inv, ErrorKind::Syntax)
}

fn symbol_function(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let description = match arg(&inv, 0) {
        HeapValue::Undefined => None,
        value => Some(engine.to_string(&value)?),
    };
    Ok(engine.symbol(description.as_deref()))
}

fn bigint_function(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    match arg(&inv, 0) {
        HeapValue::BigInt(n) => Ok(HeapValue::BigInt(n)),
        HeapValue::Bool(b) => Ok(HeapValue::BigInt(i128::from(b))),
        HeapValue::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 {
                Ok(HeapValue::BigInt(n as i128))
            } else {
                Err(engine.throw(
                    ErrorKind::Range,
                    &format!(
                        "The number {} cannot be converted to a BigInt because it is not an integer",
                        n
                    ),
                ))
            }
        }
        HeapValue::String(units) => {
            let text = String::from_utf16_lossy(&units);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(HeapValue::BigInt(0));
            }
            trimmed.parse::<i128>().map(HeapValue::BigInt).map_err(|_| {
                engine.throw(
                    ErrorKind::Syntax,
                    &format!("Cannot convert {} to a BigInt", text),
                )
            })
        }
        other => Err(engine.throw(
            ErrorKind::Type,
            &format!("Cannot convert {:?} to a BigInt", other),
        )),
    }
}

fn date_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let time = match inv.args.first() {
        Some(value) => engine.to_number(value)?,
        None => chrono::Utc::now().timestamp_millis() as f64,
    };
    Ok(engine.make_date(time))
}

fn promise_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    require_new(engine, &inv, "Promise")?;
    let executor = arg(&inv, 0);
    if engine.kind(&executor) != ValueKind::Function {
        return Err(engine.throw(ErrorKind::Type, "Promise resolver is not a function"));
    }

    let promise = engine.alloc(
        ObjectKind::Promise(PromiseState::Pending),
        Some(engine.intrinsics().promise_prototype),
    );
    let resolve = engine.alloc_function(
        "resolve",
        Rc::new(promise_resolve as Builtin),
        vec![promise.clone()],
    );
    let reject = engine.alloc_function(
        "reject",
        Rc::new(promise_reject as Builtin),
        vec![promise.clone()],
    );

    if let Err(error) = engine.call(&executor, &HeapValue::Undefined, &[resolve, reject]) {
        engine.settle_promise(&promise, PromiseState::Rejected(error));
    }
    Ok(promise)
}

fn promise_resolve(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let promise = engine.function_slot(&inv.callee, 0);
    engine.settle_promise(&promise, PromiseState::Fulfilled(arg(&inv, 0)));
    Ok(HeapValue::Undefined)
}

fn promise_reject(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let promise = engine.function_slot(&inv.callee, 0);
    engine.settle_promise(&promise, PromiseState::Rejected(arg(&inv, 0)));
    Ok(HeapValue::Undefined)
}

fn weak_map_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    require_new(engine, &inv, "WeakMap")?;
    Ok(engine.alloc(
        ObjectKind::WeakMap(Vec::new()),
        Some(engine.intrinsics().weak_map_prototype),
    ))
}

fn with_entries<R>(
    engine: &HeapEngine,
    this: &HeapValue,
    method: &str,
    f: impl FnOnce(&mut Vec<(ObjectRef, HeapValue)>) -> R,
) -> JsResult<R, HeapValue> {
    engine
        .with_object_mut(this, |o| match &mut o.kind {
            ObjectKind::WeakMap(entries) => Some(f(entries)),
            _ => None,
        })
        .flatten()
        .ok_or_else(|| {
            engine.throw(
                ErrorKind::Type,
                &format!("WeakMap.prototype.{} called on incompatible receiver", method),
            )
        })
}

fn weak_map_get(engine: &HeapEngine, inv: Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue> {
    let key = arg(&inv, 0).as_object();
    with_entries(engine, &inv.this, "get", |entries| {
        key.and_then(|key| entries.iter().find(|(k, _)| *k == key))
            .map(|(_, v)| v.clone())
            .unwrap_or(HeapValue::Undefined)
    })
}

fn weak_map_has(engine: &HeapEngine, inv: Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue> {
    let key = arg(&inv, 0).as_object();
    with_entries(engine, &inv.this, "has", |entries| {
        HeapValue::Bool(key.map_or(false, |key| entries.iter().any(|(k, _)| *k == key)))
    })
}

fn weak_map_delete(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let key = arg(&inv, 0).as_object();
    with_entries(engine, &inv.this, "delete", |entries| {
        let before = entries.len();
        if let Some(key) = key {
            entries.retain(|(k, _)| *k != key);
        }
        HeapValue::Bool(entries.len() != before)
    })
}

fn weak_map_set(engine: &HeapEngine, inv: Invocation<HeapValue>) -> JsResult<HeapValue, HeapValue> {
    let Some(key) = arg(&inv, 0).as_object() else {
        return Err(engine.throw(ErrorKind::Type, "Invalid value used as weak map key"));
    };
    let value = arg(&inv, 1);
    with_entries(engine, &inv.this, "set", |entries| {
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    })?;
    Ok(inv.this)
}

fn registry_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    require_new(engine, &inv, "FinalizationRegistry")?;
    let cleanup = arg(&inv, 0);
    if !engine.is_callable(&cleanup) {
        return Err(engine.throw(
            ErrorKind::Type,
            "FinalizationRegistry: cleanup must be callable",
        ));
    }
    Ok(engine.alloc(
        ObjectKind::FinalizationRegistry {
            cleanup,
            cells: Vec::new(),
        },
        Some(engine.intrinsics().registry_prototype),
    ))
}

fn registry_register(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    let Some(target) = arg(&inv, 0).as_object() else {
        return Err(engine.throw(ErrorKind::Type, "register: invalid target"));
    };
    let held = arg(&inv, 1);
    if held.as_object() == Some(target) {
        return Err(engine.throw(
            ErrorKind::Type,
            "register: target and holdings must not be same",
        ));
    }
    engine
        .with_object_mut(&inv.this, |o| match &mut o.kind {
            ObjectKind::FinalizationRegistry { cells, .. } => {
                cells.push(RegistryCell { target, held });
                true
            }
            _ => false,
        })
        .filter(|registered| *registered)
        .ok_or_else(|| {
            engine.throw(
                ErrorKind::Type,
                "FinalizationRegistry.prototype.register called on incompatible receiver",
            )
        })?;
    Ok(HeapValue::Undefined)
}

fn to_index(engine: &HeapEngine, value: &HeapValue, what: &str) -> JsResult<usize, HeapValue> {
    if matches!(value, HeapValue::Undefined) {
        return Ok(0);
    }
    let n = engine.to_number(value)?;
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < 0.0 || n > 9_007_199_254_740_991.0 {
        return Err(engine.throw(ErrorKind::Range, &format!("Invalid {}", what)));
    }
    Ok(n as usize)
}

fn array_buffer_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    require_new(engine, &inv, "ArrayBuffer")?;
    let length = to_index(engine, &arg(&inv, 0), "array buffer length")?;
    engine.make_array_buffer(length)
}

fn data_view_constructor(
    engine: &HeapEngine,
    inv: Invocation<HeapValue>,
) -> JsResult<HeapValue, HeapValue> {
    require_new(engine, &inv, "DataView")?;
    let buffer = arg(&inv, 0);
    let Some((_, buffer_length)) = engine.array_buffer_data(&buffer) else {
        return Err(engine.throw(
            ErrorKind::Type,
            "First argument to DataView constructor must be an ArrayBuffer",
        ));
    };

    let byte_offset = to_index(engine, &arg(&inv, 1), "DataView offset")?;
    if byte_offset > buffer_length {
        return Err(engine.throw(
            ErrorKind::Range,
            &format!("Start offset {} is outside the bounds of the buffer", byte_offset),
        ));
    }
    let byte_length = match arg(&inv, 2) {
        HeapValue::Undefined => buffer_length - byte_offset,
        value => to_index(engine, &value, "DataView length")?,
    };
    if byte_offset + byte_length > buffer_length {
        return Err(engine.throw(
            ErrorKind::Range,
            &format!("Invalid DataView length {}", byte_length),
        ));
    }

    let view = engine.alloc(
        ObjectKind::Ordinary,
        Some(engine.intrinsics().data_view_prototype),
    );
    engine.with_object_mut(&view, |o| {
        for (name, value) in [
            ("buffer", buffer),
            ("byteOffset", HeapValue::Number(byte_offset as f64)),
            ("byteLength", HeapValue::Number(byte_length as f64)),
        ] {
            o.set_own(PropertyKey::named(name), Property::data(value, false, false, false));
        }
    });
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::utf16;

    type Completion = JsResult<HeapValue, HeapValue>;

    fn global_fn(engine: &HeapEngine, name: &str) -> HeapValue {
        engine
            .get_property(&engine.global(), &HeapValue::string(name))
            .unwrap()
    }

    fn static_fn(engine: &HeapEngine, owner: &str, name: &str) -> HeapValue {
        let owner = global_fn(engine, owner);
        engine.get_property(&owner, &HeapValue::string(name)).unwrap()
    }

    #[test]
    fn test_define_property_and_descriptor() {
        let engine = HeapEngine::new();
        let target = engine.make_object();
        let descriptor = engine.make_object();
        engine
            .set_property(&descriptor, &HeapValue::string("value"), &HeapValue::Number(7.0))
            .unwrap();
        engine
            .set_property(&descriptor, &HeapValue::string("enumerable"), &HeapValue::Bool(true))
            .unwrap();

        let define = static_fn(&engine, "Object", "defineProperty");
        engine
            .call(
                &define,
                &HeapValue::Undefined,
                &[target.clone(), HeapValue::string("x"), descriptor],
            )
            .unwrap();

        let read = static_fn(&engine, "Object", "getOwnPropertyDescriptor");
        let result = engine
            .call(&read, &HeapValue::Undefined, &[target.clone(), HeapValue::string("x")])
            .unwrap();
        let writable = engine.get_property(&result, &HeapValue::string("writable")).unwrap();
        let enumerable = engine.get_property(&result, &HeapValue::string("enumerable")).unwrap();
        assert_eq!(writable.as_bool(), Some(false));
        assert_eq!(enumerable.as_bool(), Some(true));

        engine
            .set_property(&target, &HeapValue::string("x"), &HeapValue::Number(1.0))
            .unwrap();
        let x = engine.get_property(&target, &HeapValue::string("x")).unwrap();
        assert_eq!(x.as_number(), Some(7.0));
    }

    #[test]
    fn test_error_constructors() {
        let engine = HeapEngine::new();
        let type_error = global_fn(&engine, "TypeError");
        let error = engine
            .construct(&type_error, &[HeapValue::string("bad")])
            .unwrap();
        assert!(engine.instance_of(&error, &global_fn(&engine, "Error")).unwrap());
        let text = String::from_utf16(&engine.to_string(&error).unwrap()).unwrap();
        assert_eq!(text, "TypeError: bad");
    }

    #[test]
    fn test_bigint_parsing() {
        let engine = HeapEngine::new();
        let bigint = global_fn(&engine, "BigInt");
        let value = engine
            .call(&bigint, &HeapValue::Undefined, &[HeapValue::string("-9223372036854775808")])
            .unwrap();
        assert!(matches!(value, HeapValue::BigInt(n) if n == i128::from(i64::MIN)));
        assert!(engine
            .call(&bigint, &HeapValue::Undefined, &[HeapValue::string("1.5")])
            .is_err());
        assert!(engine.construct(&bigint, &[HeapValue::Number(1.0)]).is_err());
    }

    #[test]
    fn test_promise_settles_once() {
        let engine = HeapEngine::new();
        let executor: NativeCallback<HeapEngine> =
            Rc::new(|engine: &HeapEngine, inv: Invocation<HeapValue>| -> Completion {
                engine.call(&inv.args[0], &HeapValue::Undefined, &[HeapValue::Number(1.0)])?;
                engine.call(&inv.args[1], &HeapValue::Undefined, &[HeapValue::Number(2.0)])?;
                Ok(HeapValue::Undefined)
            });
        let executor = engine.make_function("executor", executor);
        let promise = engine
            .construct(&global_fn(&engine, "Promise"), &[executor])
            .unwrap();
        assert!(matches!(
            engine.promise_state(&promise),
            Some(PromiseState::Fulfilled(HeapValue::Number(n))) if n == 1.0
        ));
    }

    #[test]
    fn test_weak_map_is_ephemeral() {
        let engine = HeapEngine::new();
        let map = engine.construct(&global_fn(&engine, "WeakMap"), &[]).unwrap();
        engine.protect(&map);
        let key = engine.make_object();
        let value = engine.make_object();
        let set = engine.get_property(&map, &HeapValue::string("set")).unwrap();
        engine.call(&set, &map, &[key.clone(), value.clone()]).unwrap();

        engine.protect(&key);
        engine.collect();
        assert!(engine.is_alive(&value));

        engine.unprotect(&key);
        engine.collect();
        assert!(!engine.is_alive(&key));
        assert!(!engine.is_alive(&value));
    }

    #[test]
    fn test_registry_runs_cleanup_after_collect() {
        let engine = HeapEngine::new();
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let cleanup: NativeCallback<HeapEngine> =
            Rc::new(move |_: &HeapEngine, inv: Invocation<HeapValue>| -> Completion {
                sink.borrow_mut().push(inv.args[0].clone());
                Ok(HeapValue::Undefined)
            });
        let cleanup = engine.make_function("cleanup", cleanup);
        let registry = engine
            .construct(&global_fn(&engine, "FinalizationRegistry"), &[cleanup])
            .unwrap();
        engine.protect(&registry);

        let target = engine.make_object();
        let register = engine.get_property(&registry, &HeapValue::string("register")).unwrap();
        engine
            .call(&register, &registry, &[target, HeapValue::string("held")])
            .unwrap();

        let stats = engine.collect();
        assert_eq!(stats.cleanup_jobs, 1);
        assert_eq!(seen.borrow()[0].as_string().as_deref(), Some("held"));
    }

    #[test]
    fn test_data_view_bounds() {
        let engine = HeapEngine::new();
        let buffer = engine.make_array_buffer(4).unwrap();
        let data_view = global_fn(&engine, "DataView");
        let view = engine
            .construct(&data_view, &[buffer.clone(), HeapValue::Number(1.0)])
            .unwrap();
        let length = engine.get_property(&view, &HeapValue::string("byteLength")).unwrap();
        assert_eq!(length.as_number(), Some(3.0));

        let too_long = engine.construct(
            &data_view,
            &[buffer, HeapValue::Number(2.0), HeapValue::Number(3.0)],
        );
        let error = too_long.unwrap_err();
        assert!(engine
            .instance_of(&error, &global_fn(&engine, "RangeError"))
            .unwrap());
    }

    #[test]
    fn test_own_property_names_and_symbols() {
        let engine = HeapEngine::new();
        let target = engine.make_object();
        let symbol = engine.symbol(Some(&utf16("s")));
        engine.set_property(&target, &symbol, &HeapValue::Null).unwrap();
        engine.set_property(&target, &HeapValue::string("a"), &HeapValue::Null).unwrap();

        let names = engine
            .call(
                &static_fn(&engine, "Object", "getOwnPropertyNames"),
                &HeapValue::Undefined,
                &[target.clone()],
            )
            .unwrap();
        let symbols = engine
            .call(
                &static_fn(&engine, "Object", "getOwnPropertySymbols"),
                &HeapValue::Undefined,
                &[target],
            )
            .unwrap();
        assert_eq!(engine.get_index(&names, 0).unwrap().as_string().as_deref(), Some("a"));
        assert!(engine.strict_equals(&engine.get_index(&symbols, 0).unwrap(), &symbol));
    }
}
