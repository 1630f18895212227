//! In-memory reference engine.
//!
//! A non-moving mark/sweep heap: objects live in a `Vec` of slots and handles
//! carry the slot index plus a per-slot generation, so stale handles are
//! detected after a slot is reused. Collection only happens when
//! [`HeapEngine::collect`] is called. Roots are the intrinsics (which keep the
//! global object alive) and protected values; values held only by Rust code
//! are not roots.
//!
//! `WeakMap` entries are ephemerons. `FinalizationRegistry` cleanup callbacks
//! and private-slot destructors run after the sweep, once the heap borrow has
//! been released, so they may re-enter the engine.

mod builtins;

use super::{
    to_int32, to_uint32, BufferKind, Engine, Invocation, JsResult, NativeCallback, TypedArrayInfo,
    TypedArrayKind, ValueKind,
};
use builtins::Intrinsics;
use chrono::TimeZone;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// Hard upper bound for prototype chain walks
pub const MAX_PROTOTYPE_CHAIN: usize = 10_000;

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    index: u32,
    generation: u32,
}

/// Symbol identity. Two symbols are equal only if they are the same `Rc`.
pub struct Symbol {
    description: Option<Rc<[u16]>>,
}

impl Symbol {
    /// Description passed at creation
    pub fn description(&self) -> Option<String> {
        self.description
            .as_ref()
            .map(|units| String::from_utf16_lossy(units))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.description().unwrap_or_default())
    }
}

/// Value handle of the heap engine
#[derive(Clone)]
pub enum HeapValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number
    Number(f64),
    /// String as UTF-16 code units
    String(Rc<[u16]>),
    /// Symbol
    Symbol(Rc<Symbol>),
    /// BigInt, limited to 128 bits
    BigInt(i128),
    /// Object
    Object(ObjectRef),
}

impl HeapValue {
    /// String value from Rust text
    pub fn string(text: &str) -> Self {
        HeapValue::String(text.encode_utf16().collect())
    }

    /// Object handle, if this is an object
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            HeapValue::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Number, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HeapValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Rust string, if this is a string
    pub fn as_string(&self) -> Option<String> {
        match self {
            HeapValue::String(units) => Some(String::from_utf16_lossy(units)),
            _ => None,
        }
    }

    /// Boolean, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeapValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Debug for HeapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapValue::Undefined => f.write_str("undefined"),
            HeapValue::Null => f.write_str("null"),
            HeapValue::Bool(b) => write!(f, "{}", b),
            HeapValue::Number(n) => write!(f, "{}", n),
            HeapValue::String(units) => write!(f, "{:?}", String::from_utf16_lossy(units)),
            HeapValue::Symbol(symbol) => write!(f, "{:?}", symbol),
            HeapValue::BigInt(n) => write!(f, "{}n", n),
            HeapValue::Object(r) => write!(f, "Object#{}.{}", r.index, r.generation),
        }
    }
}

/// Strict equality (`===`); symbols compare by identity.
impl PartialEq for HeapValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HeapValue::Undefined, HeapValue::Undefined)
            | (HeapValue::Null, HeapValue::Null) => true,
            (HeapValue::Bool(a), HeapValue::Bool(b)) => a == b,
            (HeapValue::Number(a), HeapValue::Number(b)) => a == b,
            (HeapValue::String(a), HeapValue::String(b)) => a == b,
            (HeapValue::Symbol(a), HeapValue::Symbol(b)) => Rc::ptr_eq(a, b),
            (HeapValue::BigInt(a), HeapValue::BigInt(b)) => a == b,
            (HeapValue::Object(a), HeapValue::Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Settlement state of a promise
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    /// Not settled yet
    Pending,
    /// Resolved with a value
    Fulfilled(HeapValue),
    /// Rejected with a reason
    Rejected(HeapValue),
}

/// Outcome of one [`HeapEngine::collect`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Objects reclaimed
    pub collected: usize,
    /// Finalization registry callbacks run
    pub cleanup_jobs: usize,
}

#[derive(Clone)]
pub(crate) enum PropertyKey {
    String(Rc<[u16]>),
    Symbol(Rc<Symbol>),
}

impl PropertyKey {
    pub(crate) fn named(name: &str) -> Self {
        PropertyKey::String(name.encode_utf16().collect())
    }

    fn index(index: u32) -> Self {
        Self::named(&index.to_string())
    }

    /// Canonical array index, if the key is one
    pub(crate) fn array_index(&self) -> Option<u32> {
        let PropertyKey::String(units) = self else {
            return None;
        };
        if units.is_empty() || units.len() > 10 {
            return None;
        }
        if units.len() > 1 && units[0] == u16::from(b'0') {
            return None;
        }
        let mut value: u64 = 0;
        for &unit in units.iter() {
            if !(u16::from(b'0')..=u16::from(b'9')).contains(&unit) {
                return None;
            }
            value = value * 10 + u64::from(unit - u16::from(b'0'));
        }
        if value < u64::from(u32::MAX) {
            Some(value as u32)
        } else {
            None
        }
    }

    pub(crate) fn to_value(&self) -> HeapValue {
        match self {
            PropertyKey::String(units) => HeapValue::String(Rc::clone(units)),
            PropertyKey::Symbol(symbol) => HeapValue::Symbol(Rc::clone(symbol)),
        }
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyKey::String(a), PropertyKey::String(b)) => a[..] == b[..],
            (PropertyKey::Symbol(a), PropertyKey::Symbol(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub(crate) enum PropertyValue {
    Data { value: HeapValue, writable: bool },
    Accessor { get: HeapValue, set: HeapValue },
}

#[derive(Clone)]
pub(crate) struct Property {
    pub(crate) value: PropertyValue,
    pub(crate) enumerable: bool,
    pub(crate) configurable: bool,
}

impl Property {
    pub(crate) fn data(
        value: HeapValue,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    ) -> Self {
        Self {
            value: PropertyValue::Data { value, writable },
            enumerable,
            configurable,
        }
    }

    /// Writable, configurable, not enumerable. Used for builtin methods.
    pub(crate) fn hidden(value: HeapValue) -> Self {
        Self::data(value, true, false, true)
    }
}

/// Partial property descriptor, as accepted by `Object.defineProperty`
#[derive(Clone, Default)]
pub(crate) struct Descriptor {
    pub(crate) value: Option<HeapValue>,
    pub(crate) writable: Option<bool>,
    pub(crate) get: Option<HeapValue>,
    pub(crate) set: Option<HeapValue>,
    pub(crate) enumerable: Option<bool>,
    pub(crate) configurable: Option<bool>,
}

impl Descriptor {
    fn is_accessor(&self) -> bool {
        self.get.is_some() || self.set.is_some()
    }
}

pub(crate) enum BufferData {
    Owned(Box<[Cell<u8>]>),
    External {
        data: *mut u8,
        len: usize,
        release: Option<Box<dyn FnOnce()>>,
    },
}

impl BufferData {
    fn bytes(&self) -> &[Cell<u8>] {
        match self {
            BufferData::Owned(cells) => &cells[..],
            BufferData::External { data, len, .. } => {
                if data.is_null() || *len == 0 {
                    return &[];
                }
                // SAFETY: the embedder guarantees `data` is valid for `len` bytes
                // until `release` runs, and `Cell<u8>` has the layout of `u8`.
                unsafe { std::slice::from_raw_parts(*data as *const Cell<u8>, *len) }
            }
        }
    }

    fn base(&self) -> (*mut u8, usize) {
        match self {
            BufferData::Owned(cells) => (cells.as_ptr() as *mut u8, cells.len()),
            BufferData::External { data, len, .. } => (*data, *len),
        }
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        if let BufferData::External { release, .. } = self {
            if let Some(release) = release.take() {
                release();
            }
        }
    }
}

pub(crate) struct TypedArrayData {
    kind: TypedArrayKind,
    buffer: ObjectRef,
    byte_offset: usize,
    length: usize,
}

pub(crate) struct RegistryCell {
    target: ObjectRef,
    held: HeapValue,
}

pub(crate) struct FunctionData {
    name: Rc<str>,
    callback: NativeCallback<HeapEngine>,
    constructor: bool,
    slots: Vec<HeapValue>,
}

pub(crate) enum ObjectKind {
    Ordinary,
    Array,
    Function(FunctionData),
    Error,
    Date(f64),
    Primitive(HeapValue),
    ArrayBuffer(BufferData),
    TypedArray(TypedArrayData),
    Promise(PromiseState),
    WeakMap(Vec<(ObjectRef, HeapValue)>),
    FinalizationRegistry {
        cleanup: HeapValue,
        cells: Vec<RegistryCell>,
    },
}

pub(crate) struct Object {
    kind: ObjectKind,
    prototype: Option<ObjectRef>,
    properties: Vec<(PropertyKey, Property)>,
    extensible: bool,
    private: Option<Rc<dyn Any>>,
}

impl Object {
    pub(crate) fn new(kind: ObjectKind, prototype: Option<ObjectRef>) -> Self {
        Self {
            kind,
            prototype,
            properties: Vec::new(),
            extensible: true,
            private: None,
        }
    }

    fn own(&self, key: &PropertyKey) -> Option<&Property> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, property)| property)
    }

    pub(crate) fn set_own(&mut self, key: PropertyKey, property: Property) {
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = property,
            None => self.properties.push((key, property)),
        }
    }

    fn remove_own(&mut self, key: &PropertyKey) {
        self.properties.retain(|(k, _)| k != key);
    }

    fn array_length(&self) -> u32 {
        match self.own(&PropertyKey::named("length")) {
            Some(Property {
                value: PropertyValue::Data { value: HeapValue::Number(n), .. },
                ..
            }) => *n as u32,
            _ => 0,
        }
    }

    fn set_array_length(&mut self, length: u32) {
        self.set_own(
            PropertyKey::named("length"),
            Property::data(HeapValue::Number(f64::from(length)), true, false, false),
        );
    }

    fn trace(&self, work: &mut Vec<ObjectRef>) {
        fn value(v: &HeapValue, work: &mut Vec<ObjectRef>) {
            if let HeapValue::Object(r) = v {
                work.push(*r);
            }
        }

        if let Some(prototype) = self.prototype {
            work.push(prototype);
        }
        for (_, property) in &self.properties {
            match &property.value {
                PropertyValue::Data { value: v, .. } => value(v, work),
                PropertyValue::Accessor { get, set } => {
                    value(get, work);
                    value(set, work);
                }
            }
        }
        match &self.kind {
            ObjectKind::Function(data) => data.slots.iter().for_each(|v| value(v, work)),
            ObjectKind::Primitive(v) => value(v, work),
            ObjectKind::TypedArray(data) => work.push(data.buffer),
            ObjectKind::Promise(PromiseState::Fulfilled(v) | PromiseState::Rejected(v)) => {
                value(v, work)
            }
            ObjectKind::FinalizationRegistry { cleanup, cells } => {
                value(cleanup, work);
                cells.iter().for_each(|cell| value(&cell.held, work));
            }
            // Weak map values are traced as ephemerons
            _ => {}
        }
    }
}

struct HeapSlot {
    generation: u32,
    object: Option<Object>,
}

type CleanupJob = (HeapValue, HeapValue);

pub(crate) struct Heap {
    slots: Vec<HeapSlot>,
    free_list: Vec<u32>,
    protected: HashMap<ObjectRef, usize>,
    live: usize,
}

impl Heap {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            protected: HashMap::new(),
            live: 0,
        }
    }

    pub(crate) fn alloc(&mut self, object: Object) -> ObjectRef {
        self.live += 1;
        match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                ObjectRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(HeapSlot {
                    generation: 0,
                    object: Some(object),
                });
                ObjectRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, r: ObjectRef) -> Option<&Object> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    pub(crate) fn get_mut(&mut self, r: ObjectRef) -> Option<&mut Object> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    pub(crate) fn define(&mut self, r: ObjectRef, key: PropertyKey, property: Property) {
        if let Some(object) = self.get_mut(r) {
            object.set_own(key, property);
        }
    }

    pub(crate) fn function(
        &mut self,
        function_prototype: ObjectRef,
        name: &str,
        callback: NativeCallback<HeapEngine>,
        constructor: bool,
        slots: Vec<HeapValue>,
    ) -> ObjectRef {
        let mut object = Object::new(
            ObjectKind::Function(FunctionData {
                name: Rc::from(name),
                callback,
                constructor,
                slots,
            }),
            Some(function_prototype),
        );
        object.set_own(
            PropertyKey::named("name"),
            Property::data(HeapValue::string(name), false, false, true),
        );
        self.alloc(object)
    }

    /// Walk the prototype chain; returns the owner and a copy of the property
    fn lookup(&self, start: ObjectRef, key: &PropertyKey) -> Option<(ObjectRef, Property)> {
        let mut current = start;
        for _ in 0..MAX_PROTOTYPE_CHAIN {
            let object = self.get(current)?;
            if let Some(property) = object.own(key) {
                return Some((current, property.clone()));
            }
            current = object.prototype?;
        }
        None
    }

    fn collect(&mut self, roots: &[ObjectRef]) -> (Vec<Object>, Vec<CleanupJob>) {
        let mut marks = vec![false; self.slots.len()];
        let mut work: Vec<ObjectRef> = roots.to_vec();
        work.extend(self.protected.keys().copied());

        loop {
            while let Some(r) = work.pop() {
                let Some(object) = self.get(r) else {
                    continue;
                };
                let index = r.index as usize;
                if marks[index] {
                    continue;
                }
                marks[index] = true;
                object.trace(&mut work);
            }

            // Ephemerons: a weak map value is live while both map and key are
            for (index, slot) in self.slots.iter().enumerate() {
                if !marks[index] {
                    continue;
                }
                if let Some(Object {
                    kind: ObjectKind::WeakMap(entries),
                    ..
                }) = &slot.object
                {
                    for (key, value) in entries {
                        let key_live = self.slots[key.index as usize].generation == key.generation
                            && marks[key.index as usize];
                        if let (true, HeapValue::Object(v)) = (key_live, value) {
                            if !marks[v.index as usize] {
                                work.push(*v);
                            }
                        }
                    }
                }
            }

            if work.is_empty() {
                break;
            }
        }

        let generations: Vec<u32> = self.slots.iter().map(|slot| slot.generation).collect();
        let alive = |r: &ObjectRef| {
            let index = r.index as usize;
            marks[index] && generations[index] == r.generation
        };

        let mut dead = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if marks[index] {
                continue;
            }
            if let Some(object) = slot.object.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                dead.push(object);
            }
        }
        self.live -= dead.len();

        let mut jobs = Vec::new();
        for slot in self.slots.iter_mut() {
            match slot.object.as_mut().map(|object| &mut object.kind) {
                Some(ObjectKind::WeakMap(entries)) => entries.retain(|(key, _)| alive(key)),
                Some(ObjectKind::FinalizationRegistry { cleanup, cells }) => {
                    for cell in std::mem::take(cells) {
                        if alive(&cell.target) {
                            cells.push(cell);
                        } else {
                            jobs.push((cleanup.clone(), cell.held));
                        }
                    }
                }
                _ => {}
            }
        }

        (dead, jobs)
    }

    /// Empty the heap for context teardown.
    ///
    /// Values held by finalization registries come back first, so their
    /// cleanup hooks run before the records of the objects they watch.
    fn drain(&mut self) -> (Vec<Object>, Vec<Object>) {
        let mut held = HashSet::new();
        for slot in &self.slots {
            if let Some(Object {
                kind: ObjectKind::FinalizationRegistry { cells, .. },
                ..
            }) = &slot.object
            {
                held.extend(cells.iter().filter_map(|cell| cell.held.as_object()));
            }
        }

        let mut first = Vec::new();
        let mut rest = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(object) = slot.object.take() else {
                continue;
            };
            let r = ObjectRef {
                index: index as u32,
                generation: slot.generation,
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free_list.push(index as u32);
            if held.contains(&r) {
                first.push(object);
            } else {
                rest.push(object);
            }
        }
        self.protected.clear();
        self.live = 0;
        (first, rest)
    }
}

/// Error constructors the engine itself throws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Error,
    Type,
    Range,
    Syntax,
}

/// Reference engine with an explicit garbage collector
pub struct HeapEngine {
    heap: RefCell<Heap>,
    intrinsics: Intrinsics,
    collections: Cell<u64>,
}

impl HeapEngine {
    /// Create an engine with a fresh global scope
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let intrinsics = builtins::install(&mut heap);
        debug!(objects = heap.live, "Created heap engine");
        Self {
            heap: RefCell::new(heap),
            intrinsics,
            collections: Cell::new(0),
        }
    }

    /// Run a full collection.
    ///
    /// Registry cleanup callbacks run first, in registration order, so weak
    /// references are already cleared when the private-slot data and
    /// external buffer releases of reclaimed objects are dropped.
    pub fn collect(&self) -> CollectStats {
        let roots = self.intrinsics.roots();
        let (dead, jobs) = self.heap.borrow_mut().collect(&roots);
        let collected = dead.len();

        let cleanup_jobs = jobs.len();
        for (cleanup, held) in jobs {
            if let Err(error) = self.call(&cleanup, &HeapValue::Undefined, &[held]) {
                debug!(?error, "Finalization registry cleanup threw");
            }
        }
        drop(dead);

        self.collections.set(self.collections.get() + 1);
        trace!(collected, cleanup_jobs, "Collected heap");
        CollectStats {
            collected,
            cleanup_jobs,
        }
    }

    /// Number of collections run
    pub fn collections(&self) -> u64 {
        self.collections.get()
    }

    /// Number of live objects
    pub fn live_objects(&self) -> usize {
        self.heap.borrow().live
    }

    /// Whether `value` is a primitive or a live object
    pub fn is_alive(&self, value: &HeapValue) -> bool {
        match value {
            HeapValue::Object(r) => self.heap.borrow().get(*r).is_some(),
            _ => true,
        }
    }

    /// Outstanding protect count of `value`
    pub fn protect_count(&self, value: &HeapValue) -> usize {
        value
            .as_object()
            .and_then(|r| self.heap.borrow().protected.get(&r).copied())
            .unwrap_or(0)
    }

    /// Settlement state, if `value` is a promise
    pub fn promise_state(&self, value: &HeapValue) -> Option<PromiseState> {
        self.with_object(value, |object| match &object.kind {
            ObjectKind::Promise(state) => Some(state.clone()),
            _ => None,
        })
        .flatten()
    }

    pub(crate) fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub(crate) fn with_object<R>(
        &self,
        value: &HeapValue,
        f: impl FnOnce(&Object) -> R,
    ) -> Option<R> {
        let r = value.as_object()?;
        let heap = self.heap.borrow();
        heap.get(r).map(f)
    }

    pub(crate) fn with_object_mut<R>(
        &self,
        value: &HeapValue,
        f: impl FnOnce(&mut Object) -> R,
    ) -> Option<R> {
        let r = value.as_object()?;
        let mut heap = self.heap.borrow_mut();
        heap.get_mut(r).map(f)
    }

    pub(crate) fn alloc(&self, kind: ObjectKind, prototype: Option<ObjectRef>) -> HeapValue {
        HeapValue::Object(self.heap.borrow_mut().alloc(Object::new(kind, prototype)))
    }

    pub(crate) fn alloc_function(
        &self,
        name: &str,
        callback: NativeCallback<HeapEngine>,
        slots: Vec<HeapValue>,
    ) -> HeapValue {
        let prototype = self.intrinsics.function_prototype;
        HeapValue::Object(
            self.heap
                .borrow_mut()
                .function(prototype, name, callback, false, slots),
        )
    }

    pub(crate) fn function_slot(&self, function: &HeapValue, index: usize) -> HeapValue {
        self.with_object(function, |object| match &object.kind {
            ObjectKind::Function(data) => data.slots.get(index).cloned(),
            _ => None,
        })
        .flatten()
        .unwrap_or(HeapValue::Undefined)
    }

    pub(crate) fn throw(&self, kind: ErrorKind, message: &str) -> HeapValue {
        self.make_error(kind, Some(&message.encode_utf16().collect::<Vec<_>>()))
    }

    pub(crate) fn make_error(&self, kind: ErrorKind, message: Option<&[u16]>) -> HeapValue {
        let prototype = match kind {
            ErrorKind::Error => self.intrinsics.error_prototype,
            ErrorKind::Type => self.intrinsics.type_error_prototype,
            ErrorKind::Range => self.intrinsics.range_error_prototype,
            ErrorKind::Syntax => self.intrinsics.syntax_error_prototype,
        };
        let error = self.alloc(ObjectKind::Error, Some(prototype));
        if let Some(message) = message {
            self.with_object_mut(&error, |object| {
                object.set_own(
                    PropertyKey::named("message"),
                    Property::hidden(HeapValue::String(message.into())),
                )
            });
        }
        error
    }

    pub(crate) fn is_callable(&self, value: &HeapValue) -> bool {
        self.kind(value) == ValueKind::Function
    }

    pub(crate) fn property_key(&self, key: &HeapValue) -> JsResult<PropertyKey, HeapValue> {
        Ok(match key {
            HeapValue::String(units) => PropertyKey::String(Rc::clone(units)),
            HeapValue::Symbol(symbol) => PropertyKey::Symbol(Rc::clone(symbol)),
            other => PropertyKey::String(self.to_string(other)?.into()),
        })
    }

    fn receiver(&self, value: &HeapValue, action: &str) -> JsResult<ObjectRef, HeapValue> {
        match value {
            HeapValue::Object(r) => Ok(*r),
            HeapValue::Undefined | HeapValue::Null => Err(self.throw(
                ErrorKind::Type,
                &format!("Cannot {} properties of {:?}", action, value),
            )),
            other => match self.to_object(other)? {
                HeapValue::Object(r) => Ok(r),
                _ => Err(self.throw(ErrorKind::Type, "Cannot convert to object")),
            },
        }
    }

    pub(crate) fn get_with_key(
        &self,
        object: &HeapValue,
        key: &PropertyKey,
    ) -> JsResult<HeapValue, HeapValue> {
        let target = self.receiver(object, "read")?;
        if let Some(index) = key.array_index() {
            if let Some(element) = self.typed_element(target, index) {
                return Ok(element);
            }
        }
        let found = self.heap.borrow().lookup(target, key);
        match found {
            Some((
                _,
                Property {
                    value: PropertyValue::Data { value, .. },
                    ..
                },
            )) => Ok(value),
            Some((
                _,
                Property {
                    value: PropertyValue::Accessor { get, .. },
                    ..
                },
            )) if self.is_callable(&get) => self.call(&get, object, &[]),
            _ => Ok(HeapValue::Undefined),
        }
    }

    pub(crate) fn set_with_key(
        &self,
        object: &HeapValue,
        key: &PropertyKey,
        value: &HeapValue,
    ) -> JsResult<(), HeapValue> {
        let target = match object {
            HeapValue::Object(r) => *r,
            HeapValue::Undefined | HeapValue::Null => {
                return Err(self.throw(
                    ErrorKind::Type,
                    "Cannot set properties of undefined or null",
                ))
            }
            // Writes to primitive wrappers are discarded
            _ => return Ok(()),
        };

        if let Some(index) = key.array_index() {
            if self.is_typed_array(target) {
                return self.write_typed_element(target, index, value);
            }
        }

        let is_array = self
            .with_object(object, |o| matches!(o.kind, ObjectKind::Array))
            .unwrap_or(false);
        if is_array && *key == PropertyKey::named("length") {
            return self.set_array_length(object, value);
        }

        let found = self.heap.borrow().lookup(target, key);
        match found {
            Some((
                _,
                Property {
                    value: PropertyValue::Accessor { set, .. },
                    ..
                },
            )) => {
                if self.is_callable(&set) {
                    self.call(&set, object, &[value.clone()])?;
                }
                Ok(())
            }
            Some((
                _,
                Property {
                    value: PropertyValue::Data { writable: false, .. },
                    ..
                },
            )) => Ok(()),
            Some((owner, property)) if owner == target => {
                self.with_object_mut(object, |o| {
                    o.set_own(
                        key.clone(),
                        Property::data(
                            value.clone(),
                            true,
                            property.enumerable,
                            property.configurable,
                        ),
                    )
                });
                Ok(())
            }
            _ => {
                self.with_object_mut(object, |o| {
                    if !o.extensible {
                        return;
                    }
                    o.set_own(key.clone(), Property::data(value.clone(), true, true, true));
                    if let (ObjectKind::Array, Some(index)) = (&o.kind, key.array_index()) {
                        if index >= o.array_length() {
                            o.set_array_length(index + 1);
                        }
                    }
                });
                Ok(())
            }
        }
    }

    fn set_array_length(&self, array: &HeapValue, value: &HeapValue) -> JsResult<(), HeapValue> {
        let requested = self.to_number(value)?;
        let length = to_uint32(requested);
        if f64::from(length) != requested {
            return Err(self.throw(ErrorKind::Range, "Invalid array length"));
        }
        self.with_object_mut(array, |o| {
            o.properties
                .retain(|(k, _)| k.array_index().map_or(true, |index| index < length));
            o.set_array_length(length);
        });
        Ok(())
    }

    /// Own keys in property order: array indices ascending, then strings and
    /// symbols in insertion order
    pub(crate) fn own_keys(&self, object: &HeapValue) -> Vec<PropertyKey> {
        self.with_object(object, |o| {
            let mut indices: Vec<u32> = o
                .properties
                .iter()
                .filter_map(|(k, _)| k.array_index())
                .collect();
            if let ObjectKind::TypedArray(data) = &o.kind {
                indices.extend(0..data.length as u32);
            }
            indices.sort_unstable();
            indices.dedup();

            let mut keys: Vec<PropertyKey> = indices.into_iter().map(PropertyKey::index).collect();
            keys.extend(
                o.properties
                    .iter()
                    .filter(|(k, _)| {
                        matches!(k, PropertyKey::String(_)) && k.array_index().is_none()
                    })
                    .map(|(k, _)| k.clone()),
            );
            keys.extend(
                o.properties
                    .iter()
                    .filter(|(k, _)| matches!(k, PropertyKey::Symbol(_)))
                    .map(|(k, _)| k.clone()),
            );
            keys
        })
        .unwrap_or_default()
    }

    pub(crate) fn own_property(&self, object: &HeapValue, key: &PropertyKey) -> Option<Property> {
        let r = object.as_object()?;
        if let Some(index) = key.array_index() {
            if let Some(element) = self.typed_element(r, index) {
                return match element {
                    HeapValue::Undefined => None,
                    value => Some(Property::data(value, true, true, true)),
                };
            }
        }
        self.with_object(object, |o| o.own(key).cloned()).flatten()
    }

    pub(crate) fn define_own(
        &self,
        object: &HeapValue,
        key: PropertyKey,
        descriptor: Descriptor,
    ) -> JsResult<(), HeapValue> {
        let existing = self.own_property(object, &key);
        let extensible = self.with_object(object, |o| o.extensible).unwrap_or(false);

        let property = match existing {
            Some(current) if !current.configurable => {
                let unchanged = descriptor.enumerable.map_or(true, |e| e == current.enumerable)
                    && descriptor.configurable.map_or(true, |c| !c)
                    && !descriptor.is_accessor();
                let writable_data = matches!(
                    current.value,
                    PropertyValue::Data { writable: true, .. }
                );
                if !(unchanged && writable_data) {
                    return Err(self.throw(ErrorKind::Type, "Cannot redefine property"));
                }
                let value = match (&current.value, descriptor.value) {
                    (_, Some(value)) => value,
                    (PropertyValue::Data { value, .. }, None) => value.clone(),
                    (PropertyValue::Accessor { .. }, None) => HeapValue::Undefined,
                };
                Property::data(
                    value,
                    descriptor.writable.unwrap_or(true),
                    current.enumerable,
                    false,
                )
            }
            Some(current) => merge_descriptor(Some(&current), descriptor),
            None if !extensible => {
                return Err(self.throw(
                    ErrorKind::Type,
                    "Cannot define property, object is not extensible",
                ))
            }
            None => merge_descriptor(None, descriptor),
        };

        self.with_object_mut(object, |o| {
            let index = key.array_index();
            o.set_own(key, property);
            if let (ObjectKind::Array, Some(index)) = (&o.kind, index) {
                if index >= o.array_length() {
                    o.set_array_length(index + 1);
                }
            }
        });
        Ok(())
    }

    /// `Object.freeze` when `freeze`, otherwise `Object.seal`
    pub(crate) fn set_integrity(&self, object: &HeapValue, freeze: bool) {
        self.with_object_mut(object, |o| {
            o.extensible = false;
            for (_, property) in o.properties.iter_mut() {
                property.configurable = false;
                if freeze {
                    if let PropertyValue::Data { writable, .. } = &mut property.value {
                        *writable = false;
                    }
                }
            }
        });
    }

    pub(crate) fn settle_promise(&self, promise: &HeapValue, settled: PromiseState) {
        self.with_object_mut(promise, |o| {
            if let ObjectKind::Promise(state @ PromiseState::Pending) = &mut o.kind {
                *state = settled;
            }
        });
    }

    fn is_typed_array(&self, r: ObjectRef) -> bool {
        self.heap
            .borrow()
            .get(r)
            .map_or(false, |o| matches!(o.kind, ObjectKind::TypedArray(_)))
    }

    /// Element of a typed array; `None` when `r` is not a typed array
    fn typed_element(&self, r: ObjectRef, index: u32) -> Option<HeapValue> {
        let heap = self.heap.borrow();
        let ObjectKind::TypedArray(data) = &heap.get(r)?.kind else {
            return None;
        };
        if index as usize >= data.length {
            return Some(HeapValue::Undefined);
        }
        let size = data.kind.element_size();
        let start = data.byte_offset + index as usize * size;
        let ObjectKind::ArrayBuffer(buffer) = &heap.get(data.buffer)?.kind else {
            return Some(HeapValue::Undefined);
        };
        let bytes = buffer.bytes().get(start..start + size)?;
        let mut raw = [0u8; 8];
        for (dst, src) in raw.iter_mut().zip(bytes) {
            *dst = src.get();
        }
        Some(decode_element(data.kind, raw))
    }

    fn write_typed_element(
        &self,
        r: ObjectRef,
        index: u32,
        value: &HeapValue,
    ) -> JsResult<(), HeapValue> {
        let kind = {
            let heap = self.heap.borrow();
            match heap.get(r).map(|o| &o.kind) {
                Some(ObjectKind::TypedArray(data)) => data.kind,
                _ => return Ok(()),
            }
        };
        let raw = self.encode_element(kind, value)?;

        let heap = self.heap.borrow();
        let Some(ObjectKind::TypedArray(data)) = heap.get(r).map(|o| &o.kind) else {
            return Ok(());
        };
        if index as usize >= data.length {
            return Ok(());
        }
        let size = kind.element_size();
        let start = data.byte_offset + index as usize * size;
        if let Some(ObjectKind::ArrayBuffer(buffer)) = heap.get(data.buffer).map(|o| &o.kind) {
            if let Some(bytes) = buffer.bytes().get(start..start + size) {
                for (dst, src) in bytes.iter().zip(raw) {
                    dst.set(src);
                }
            }
        }
        Ok(())
    }

    fn encode_element(
        &self,
        kind: TypedArrayKind,
        value: &HeapValue,
    ) -> JsResult<[u8; 8], HeapValue> {
        let mut raw = [0u8; 8];
        match kind {
            TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => {
                let HeapValue::BigInt(n) = value else {
                    return Err(self.throw(ErrorKind::Type, "Cannot convert value to a BigInt"));
                };
                raw = (*n as i64).to_ne_bytes();
            }
            _ => {
                let n = self.to_number(value)?;
                match kind {
                    TypedArrayKind::Int8 | TypedArrayKind::Uint8 => raw[0] = to_int32(n) as u8,
                    TypedArrayKind::Uint8Clamped => raw[0] = clamp_u8(n),
                    TypedArrayKind::Int16 | TypedArrayKind::Uint16 => {
                        raw[..2].copy_from_slice(&(to_int32(n) as u16).to_ne_bytes())
                    }
                    TypedArrayKind::Int32 | TypedArrayKind::Uint32 => {
                        raw[..4].copy_from_slice(&to_uint32(n).to_ne_bytes())
                    }
                    TypedArrayKind::Float32 => raw[..4].copy_from_slice(&(n as f32).to_ne_bytes()),
                    _ => raw = n.to_ne_bytes(),
                }
            }
        }
        Ok(raw)
    }

    fn time_clip(time: f64) -> f64 {
        if !time.is_finite() || time.abs() > 8.64e15 {
            f64::NAN
        } else {
            time.trunc() + 0.0
        }
    }
}

impl Default for HeapEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_descriptor(current: Option<&Property>, descriptor: Descriptor) -> Property {
    let enumerable = descriptor
        .enumerable
        .or(current.map(|p| p.enumerable))
        .unwrap_or(false);
    let configurable = descriptor
        .configurable
        .or(current.map(|p| p.configurable))
        .unwrap_or(false);

    let value = if descriptor.is_accessor() {
        let (old_get, old_set) = match current.map(|p| &p.value) {
            Some(PropertyValue::Accessor { get, set }) => (get.clone(), set.clone()),
            _ => (HeapValue::Undefined, HeapValue::Undefined),
        };
        PropertyValue::Accessor {
            get: descriptor.get.unwrap_or(old_get),
            set: descriptor.set.unwrap_or(old_set),
        }
    } else {
        let (old_value, old_writable) = match current.map(|p| &p.value) {
            Some(PropertyValue::Data { value, writable }) => (value.clone(), *writable),
            _ => (HeapValue::Undefined, false),
        };
        PropertyValue::Data {
            value: descriptor.value.unwrap_or(old_value),
            writable: descriptor.writable.unwrap_or(old_writable),
        }
    };

    Property {
        value,
        enumerable,
        configurable,
    }
}

fn decode_element(kind: TypedArrayKind, raw: [u8; 8]) -> HeapValue {
    let [b0, b1, b2, b3, ..] = raw;
    let word = [b0, b1, b2, b3];
    match kind {
        TypedArrayKind::Int8 => HeapValue::Number(f64::from(b0 as i8)),
        TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => HeapValue::Number(f64::from(b0)),
        TypedArrayKind::Int16 => HeapValue::Number(f64::from(i16::from_ne_bytes([b0, b1]))),
        TypedArrayKind::Uint16 => HeapValue::Number(f64::from(u16::from_ne_bytes([b0, b1]))),
        TypedArrayKind::Int32 => HeapValue::Number(f64::from(i32::from_ne_bytes(word))),
        TypedArrayKind::Uint32 => HeapValue::Number(f64::from(u32::from_ne_bytes(word))),
        TypedArrayKind::Float32 => HeapValue::Number(f64::from(f32::from_ne_bytes(word))),
        TypedArrayKind::Float64 => HeapValue::Number(f64::from_ne_bytes(raw)),
        TypedArrayKind::BigInt64 => HeapValue::BigInt(i128::from(i64::from_ne_bytes(raw))),
        TypedArrayKind::BigUint64 => HeapValue::BigInt(i128::from(u64::from_ne_bytes(raw))),
    }
}

fn clamp_u8(n: f64) -> u8 {
    if n.is_nan() || n <= 0.0 {
        return 0;
    }
    if n >= 255.0 {
        return 255;
    }
    let floor = n.floor();
    let rounded = match n - floor {
        d if d > 0.5 => floor + 1.0,
        d if d < 0.5 => floor,
        _ if floor % 2.0 == 0.0 => floor,
        _ => floor + 1.0,
    };
    rounded as u8
}

/// ECMAScript Number::toString for radix 10
pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}

/// ECMAScript StringToNumber
pub(crate) fn string_to_number(units: &[u16]) -> f64 {
    let text = String::from_utf16_lossy(units);
    let text = text.trim();
    match text {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0o", 8), ("0O", 8), ("0b", 2), ("0B", 2)] {
        if let Some(digits) = text.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix).map_or(f64::NAN, |v| v as f64);
        }
    }
    if text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        text.parse::<f64>().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

impl Engine for HeapEngine {
    type Value = HeapValue;

    fn undefined(&self) -> HeapValue {
        HeapValue::Undefined
    }

    fn null(&self) -> HeapValue {
        HeapValue::Null
    }

    fn boolean(&self, value: bool) -> HeapValue {
        HeapValue::Bool(value)
    }

    fn number(&self, value: f64) -> HeapValue {
        HeapValue::Number(value)
    }

    fn string(&self, units: &[u16]) -> HeapValue {
        HeapValue::String(units.into())
    }

    fn symbol(&self, description: Option<&[u16]>) -> HeapValue {
        HeapValue::Symbol(Rc::new(Symbol {
            description: description.map(Rc::from),
        }))
    }

    fn kind(&self, value: &HeapValue) -> ValueKind {
        match value {
            HeapValue::Undefined => ValueKind::Undefined,
            HeapValue::Null => ValueKind::Null,
            HeapValue::Bool(_) => ValueKind::Boolean,
            HeapValue::Number(_) => ValueKind::Number,
            HeapValue::String(_) => ValueKind::String,
            HeapValue::Symbol(_) => ValueKind::Symbol,
            HeapValue::BigInt(_) => ValueKind::BigInt,
            HeapValue::Object(_) => {
                let callable = self
                    .with_object(value, |o| matches!(o.kind, ObjectKind::Function(_)))
                    .unwrap_or(false);
                if callable {
                    ValueKind::Function
                } else {
                    ValueKind::Object
                }
            }
        }
    }

    fn to_number(&self, value: &HeapValue) -> JsResult<f64, HeapValue> {
        match value {
            HeapValue::Undefined => Ok(f64::NAN),
            HeapValue::Null => Ok(0.0),
            HeapValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            HeapValue::Number(n) => Ok(*n),
            HeapValue::String(units) => Ok(string_to_number(units)),
            HeapValue::Symbol(_) => Err(self.throw(
                ErrorKind::Type,
                "Cannot convert a Symbol value to a number",
            )),
            HeapValue::BigInt(_) => Err(self.throw(
                ErrorKind::Type,
                "Cannot convert a BigInt value to a number",
            )),
            HeapValue::Object(_) => {
                let primitive = self
                    .with_object(value, |o| match &o.kind {
                        ObjectKind::Date(time) => Some(HeapValue::Number(*time)),
                        ObjectKind::Primitive(inner) => Some(inner.clone()),
                        _ => None,
                    })
                    .flatten();
                match primitive {
                    Some(inner) => self.to_number(&inner),
                    None => Ok(string_to_number(&self.to_string(value)?)),
                }
            }
        }
    }

    fn to_boolean(&self, value: &HeapValue) -> bool {
        match value {
            HeapValue::Undefined | HeapValue::Null => false,
            HeapValue::Bool(b) => *b,
            HeapValue::Number(n) => !(n.is_nan() || *n == 0.0),
            HeapValue::String(units) => !units.is_empty(),
            HeapValue::BigInt(n) => *n != 0,
            HeapValue::Symbol(_) | HeapValue::Object(_) => true,
        }
    }

    fn to_string(&self, value: &HeapValue) -> JsResult<Vec<u16>, HeapValue> {
        let text = match value {
            HeapValue::Undefined => "undefined".to_string(),
            HeapValue::Null => "null".to_string(),
            HeapValue::Bool(b) => b.to_string(),
            HeapValue::Number(n) => number_to_string(*n),
            HeapValue::String(units) => return Ok(units.to_vec()),
            HeapValue::Symbol(_) => {
                return Err(self.throw(
                    ErrorKind::Type,
                    "Cannot convert a Symbol value to a string",
                ))
            }
            HeapValue::BigInt(n) => n.to_string(),
            HeapValue::Object(_) => return self.object_to_string(value),
        };
        Ok(text.encode_utf16().collect())
    }

    fn to_object(&self, value: &HeapValue) -> JsResult<HeapValue, HeapValue> {
        match value {
            HeapValue::Undefined | HeapValue::Null => Err(self.throw(
                ErrorKind::Type,
                "Cannot convert undefined or null to object",
            )),
            HeapValue::Object(_) => Ok(value.clone()),
            primitive => Ok(self.alloc(
                ObjectKind::Primitive(primitive.clone()),
                Some(self.intrinsics.object_prototype),
            )),
        }
    }

    fn strict_equals(&self, a: &HeapValue, b: &HeapValue) -> bool {
        a == b
    }

    fn is_array(&self, value: &HeapValue) -> bool {
        self.with_object(value, |o| matches!(o.kind, ObjectKind::Array))
            .unwrap_or(false)
    }

    fn is_date(&self, value: &HeapValue) -> bool {
        self.with_object(value, |o| matches!(o.kind, ObjectKind::Date(_)))
            .unwrap_or(false)
    }

    fn instance_of(&self, value: &HeapValue, constructor: &HeapValue) -> JsResult<bool, HeapValue> {
        if !self.is_callable(constructor) {
            return Err(self.throw(
                ErrorKind::Type,
                "Right-hand side of 'instanceof' is not callable",
            ));
        }
        let prototype = match self.get_with_key(constructor, &PropertyKey::named("prototype"))? {
            HeapValue::Object(r) => r,
            _ => {
                return Err(self.throw(
                    ErrorKind::Type,
                    "Function has non-object prototype in instanceof check",
                ))
            }
        };
        let Some(start) = value.as_object() else {
            return Ok(false);
        };
        let heap = self.heap.borrow();
        let mut current = heap.get(start).and_then(|o| o.prototype);
        for _ in 0..MAX_PROTOTYPE_CHAIN {
            match current {
                Some(r) if r == prototype => return Ok(true),
                Some(r) => current = heap.get(r).and_then(|o| o.prototype),
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    fn global(&self) -> HeapValue {
        HeapValue::Object(self.intrinsics.global)
    }

    fn make_object(&self) -> HeapValue {
        self.alloc(ObjectKind::Ordinary, Some(self.intrinsics.object_prototype))
    }

    fn make_array(&self, elements: &[HeapValue]) -> HeapValue {
        let mut object = Object::new(ObjectKind::Array, Some(self.intrinsics.array_prototype));
        for (index, element) in elements.iter().enumerate() {
            object.set_own(
                PropertyKey::index(index as u32),
                Property::data(element.clone(), true, true, true),
            );
        }
        object.set_array_length(elements.len() as u32);
        HeapValue::Object(self.heap.borrow_mut().alloc(object))
    }

    fn make_date(&self, time: f64) -> HeapValue {
        self.alloc(
            ObjectKind::Date(Self::time_clip(time)),
            Some(self.intrinsics.date_prototype),
        )
    }

    fn make_function(&self, name: &str, callback: NativeCallback<Self>) -> HeapValue {
        self.alloc_function(name, callback, Vec::new())
    }

    fn make_constructor(&self, name: &str, callback: NativeCallback<Self>) -> HeapValue {
        let mut heap = self.heap.borrow_mut();
        let constructor = heap.function(
            self.intrinsics.function_prototype,
            name,
            callback,
            true,
            Vec::new(),
        );
        let prototype = heap.alloc(Object::new(
            ObjectKind::Ordinary,
            Some(self.intrinsics.object_prototype),
        ));
        heap.define(
            constructor,
            PropertyKey::named("prototype"),
            Property::data(HeapValue::Object(prototype), true, false, false),
        );
        heap.define(
            prototype,
            PropertyKey::named("constructor"),
            Property::hidden(HeapValue::Object(constructor)),
        );
        HeapValue::Object(constructor)
    }

    fn call(
        &self,
        function: &HeapValue,
        this: &HeapValue,
        args: &[HeapValue],
    ) -> JsResult<HeapValue, HeapValue> {
        let callback = self
            .with_object(function, |o| match &o.kind {
                ObjectKind::Function(data) => Some(Rc::clone(&data.callback)),
                _ => None,
            })
            .flatten();
        let Some(callback) = callback else {
            return Err(self.throw(ErrorKind::Type, "Value is not a function"));
        };
        callback(
            self,
            Invocation {
                callee: function.clone(),
                this: this.clone(),
                args: args.to_vec(),
                new_target: None,
            },
        )
    }

    fn construct(
        &self,
        constructor: &HeapValue,
        args: &[HeapValue],
    ) -> JsResult<HeapValue, HeapValue> {
        let callback = self
            .with_object(constructor, |o| match &o.kind {
                ObjectKind::Function(data) if data.constructor => Some(Rc::clone(&data.callback)),
                _ => None,
            })
            .flatten();
        let Some(callback) = callback else {
            let name = self
                .with_object(constructor, |o| match &o.kind {
                    ObjectKind::Function(data) => Some(data.name.to_string()),
                    _ => None,
                })
                .flatten()
                .unwrap_or_else(|| "Value".to_string());
            return Err(self.throw(ErrorKind::Type, &format!("{} is not a constructor", name)));
        };

        let prototype = match self.get_with_key(constructor, &PropertyKey::named("prototype"))? {
            HeapValue::Object(r) => r,
            _ => self.intrinsics.object_prototype,
        };
        let this = self.alloc(ObjectKind::Ordinary, Some(prototype));
        let result = callback(
            self,
            Invocation {
                callee: constructor.clone(),
                this: this.clone(),
                args: args.to_vec(),
                new_target: Some(constructor.clone()),
            },
        )?;
        Ok(match result {
            HeapValue::Object(_) => result,
            _ => this,
        })
    }

    fn get_property(&self, object: &HeapValue, key: &HeapValue) -> JsResult<HeapValue, HeapValue> {
        let key = self.property_key(key)?;
        self.get_with_key(object, &key)
    }

    fn set_property(
        &self,
        object: &HeapValue,
        key: &HeapValue,
        value: &HeapValue,
    ) -> JsResult<(), HeapValue> {
        let key = self.property_key(key)?;
        self.set_with_key(object, &key, value)
    }

    fn has_property(&self, object: &HeapValue, key: &HeapValue) -> JsResult<bool, HeapValue> {
        let HeapValue::Object(start) = object else {
            return Err(self.throw(ErrorKind::Type, "Cannot use 'in' operator on a primitive"));
        };
        let key = self.property_key(key)?;
        if let Some(index) = key.array_index() {
            if let Some(element) = self.typed_element(*start, index) {
                return Ok(!matches!(element, HeapValue::Undefined));
            }
        }
        Ok(self.heap.borrow().lookup(*start, &key).is_some())
    }

    fn delete_property(&self, object: &HeapValue, key: &HeapValue) -> JsResult<bool, HeapValue> {
        let key = self.property_key(key)?;
        if !matches!(object, HeapValue::Object(_)) {
            return Ok(true);
        }
        Ok(self
            .with_object_mut(object, |o| match o.own(&key) {
                Some(property) if !property.configurable => false,
                Some(_) => {
                    o.remove_own(&key);
                    true
                }
                None => true,
            })
            .unwrap_or(true))
    }

    fn get_index(&self, object: &HeapValue, index: u32) -> JsResult<HeapValue, HeapValue> {
        self.get_with_key(object, &PropertyKey::index(index))
    }

    fn set_index(
        &self,
        object: &HeapValue,
        index: u32,
        value: &HeapValue,
    ) -> JsResult<(), HeapValue> {
        self.set_with_key(object, &PropertyKey::index(index), value)
    }

    fn prototype(&self, object: &HeapValue) -> HeapValue {
        self.with_object(object, |o| o.prototype)
            .flatten()
            .map_or(HeapValue::Null, HeapValue::Object)
    }

    fn set_prototype(&self, object: &HeapValue, prototype: &HeapValue) -> JsResult<(), HeapValue> {
        let new_prototype = match prototype {
            HeapValue::Object(r) => Some(*r),
            HeapValue::Null => None,
            _ => {
                return Err(self.throw(
                    ErrorKind::Type,
                    "Object prototype may only be an Object or null",
                ))
            }
        };
        let Some(target) = object.as_object() else {
            return Ok(());
        };

        let mut heap = self.heap.borrow_mut();
        let mut current = new_prototype;
        for _ in 0..MAX_PROTOTYPE_CHAIN {
            match current {
                Some(r) if r == target => {
                    drop(heap);
                    return Err(self.throw(ErrorKind::Type, "Cyclic __proto__ value"));
                }
                Some(r) => current = heap.get(r).and_then(|o| o.prototype),
                None => break,
            }
        }
        if let Some(o) = heap.get_mut(target) {
            o.prototype = new_prototype;
        }
        Ok(())
    }

    fn private(&self, object: &HeapValue) -> Option<Rc<dyn Any>> {
        self.with_object(object, |o| o.private.clone()).flatten()
    }

    fn set_private(&self, object: &HeapValue, data: Rc<dyn Any>) -> bool {
        self.with_object_mut(object, |o| o.private = Some(data))
            .is_some()
    }

    fn teardown(&self) {
        let (held, rest) = self.heap.borrow_mut().drain();
        let released = held.len() + rest.len();
        drop(held);
        drop(rest);
        debug!(released, "Tore down heap");
    }

    fn protect(&self, value: &HeapValue) {
        if let Some(r) = value.as_object() {
            *self.heap.borrow_mut().protected.entry(r).or_insert(0) += 1;
        }
    }

    fn unprotect(&self, value: &HeapValue) {
        let Some(r) = value.as_object() else {
            return;
        };
        let mut heap = self.heap.borrow_mut();
        if let Some(count) = heap.protected.get_mut(&r) {
            *count -= 1;
            if *count == 0 {
                heap.protected.remove(&r);
            }
        }
    }

    fn buffer_kind(&self, value: &HeapValue) -> BufferKind {
        self.with_object(value, |o| match &o.kind {
            ObjectKind::ArrayBuffer(_) => BufferKind::ArrayBuffer,
            ObjectKind::TypedArray(data) => BufferKind::TypedArray(data.kind),
            _ => BufferKind::None,
        })
        .unwrap_or(BufferKind::None)
    }

    fn make_array_buffer(&self, byte_length: usize) -> JsResult<HeapValue, HeapValue> {
        let cells: Box<[Cell<u8>]> = (0..byte_length).map(|_| Cell::new(0)).collect();
        Ok(self.alloc(
            ObjectKind::ArrayBuffer(BufferData::Owned(cells)),
            Some(self.intrinsics.array_buffer_prototype),
        ))
    }

    fn make_external_array_buffer(
        &self,
        data: *mut u8,
        byte_length: usize,
        release: Box<dyn FnOnce()>,
    ) -> JsResult<HeapValue, HeapValue> {
        Ok(self.alloc(
            ObjectKind::ArrayBuffer(BufferData::External {
                data,
                len: byte_length,
                release: Some(release),
            }),
            Some(self.intrinsics.array_buffer_prototype),
        ))
    }

    fn array_buffer_data(&self, buffer: &HeapValue) -> Option<(*mut u8, usize)> {
        self.with_object(buffer, |o| match &o.kind {
            ObjectKind::ArrayBuffer(data) => Some(data.base()),
            _ => None,
        })
        .flatten()
    }

    fn make_typed_array(
        &self,
        kind: TypedArrayKind,
        buffer: &HeapValue,
        byte_offset: usize,
        length: usize,
    ) -> JsResult<HeapValue, HeapValue> {
        let (Some(buffer_ref), Some((_, byte_length))) =
            (buffer.as_object(), self.array_buffer_data(buffer))
        else {
            return Err(self.throw(ErrorKind::Type, "Argument is not an ArrayBuffer"));
        };
        let size = kind.element_size();
        if byte_offset % size != 0 {
            return Err(self.throw(
                ErrorKind::Range,
                &format!("start offset of {} should be a multiple of {}", kind.name(), size),
            ));
        }
        if byte_offset + length * size > byte_length {
            return Err(self.throw(ErrorKind::Range, "Invalid typed array length"));
        }
        Ok(self.alloc(
            ObjectKind::TypedArray(TypedArrayData {
                kind,
                buffer: buffer_ref,
                byte_offset,
                length,
            }),
            Some(self.intrinsics.typed_array_prototype),
        ))
    }

    fn typed_array_info(&self, value: &HeapValue) -> Option<TypedArrayInfo<HeapValue>> {
        self.with_object(value, |o| match &o.kind {
            ObjectKind::TypedArray(data) => Some(TypedArrayInfo {
                kind: data.kind,
                length: data.length,
                buffer: HeapValue::Object(data.buffer),
                byte_offset: data.byte_offset,
            }),
            _ => None,
        })
        .flatten()
    }

    /// Evaluates a single literal expression, optionally preceded by `throw`.
    fn evaluate_script(&self, source: &[u16]) -> JsResult<HeapValue, HeapValue> {
        let text = String::from_utf16_lossy(source);
        let text = text.trim().trim_end_matches(';').trim();
        let (throws, expression) = match text.strip_prefix("throw ") {
            Some(rest) => (true, rest.trim()),
            None => (false, text),
        };

        let value = match expression {
            "undefined" => HeapValue::Undefined,
            "null" => HeapValue::Null,
            "true" => HeapValue::Bool(true),
            "false" => HeapValue::Bool(false),
            "globalThis" => self.global(),
            literal if literal.len() >= 2
                && (literal.starts_with('"') && literal.ends_with('"')
                    || literal.starts_with('\'') && literal.ends_with('\'')) =>
            {
                HeapValue::string(&literal[1..literal.len() - 1])
            }
            literal => {
                let units: Vec<u16> = literal.encode_utf16().collect();
                let n = string_to_number(&units);
                if literal.is_empty() || n.is_nan() && literal != "NaN" {
                    return Err(self.throw(
                        ErrorKind::Syntax,
                        &format!("Unexpected token in '{}'", literal),
                    ));
                }
                HeapValue::Number(n)
            }
        };

        if throws {
            Err(value)
        } else {
            Ok(value)
        }
    }
}

impl HeapEngine {
    fn object_to_string(&self, value: &HeapValue) -> JsResult<Vec<u16>, HeapValue> {
        enum Shape {
            Primitive(HeapValue),
            Array(u32),
            Function(Rc<str>),
            Error,
            Date(f64),
            Plain,
        }

        let shape = self
            .with_object(value, |o| match &o.kind {
                ObjectKind::Primitive(inner) => Shape::Primitive(inner.clone()),
                ObjectKind::Array => Shape::Array(o.array_length()),
                ObjectKind::Function(data) => Shape::Function(Rc::clone(&data.name)),
                ObjectKind::Error => Shape::Error,
                ObjectKind::Date(time) => Shape::Date(*time),
                _ => Shape::Plain,
            })
            .unwrap_or(Shape::Plain);

        let text = match shape {
            Shape::Primitive(inner) => return self.to_string(&inner),
            Shape::Array(length) => {
                let mut joined = Vec::new();
                for index in 0..length {
                    if index > 0 {
                        joined.push(u16::from(b','));
                    }
                    let element = self.get_index(value, index)?;
                    if !matches!(element, HeapValue::Undefined | HeapValue::Null) {
                        joined.extend(self.to_string(&element)?);
                    }
                }
                return Ok(joined);
            }
            Shape::Function(name) => format!("function {}() {{ [native code] }}", name),
            Shape::Error => {
                let name = self.get_with_key(value, &PropertyKey::named("name"))?;
                let message = self.get_with_key(value, &PropertyKey::named("message"))?;
                let name = String::from_utf16_lossy(&self.to_string(&name)?);
                let message = String::from_utf16_lossy(&self.to_string(&message)?);
                if message.is_empty() {
                    name
                } else {
                    format!("{}: {}", name, message)
                }
            }
            Shape::Date(time) => chrono::Utc
                .timestamp_millis_opt(time as i64)
                .single()
                .filter(|_| !time.is_nan())
                .map(|date| date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                .unwrap_or_else(|| "Invalid Date".to_string()),
            Shape::Plain => "[object Object]".to_string(),
        };
        Ok(text.encode_utf16().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Completion = JsResult<HeapValue, HeapValue>;

    fn key(engine: &HeapEngine, name: &str) -> HeapValue {
        engine.string(&name.encode_utf16().collect::<Vec<_>>())
    }

    #[test]
    fn test_property_roundtrip_and_order() {
        let engine = HeapEngine::new();
        let object = engine.make_object();
        engine.set_property(&object, &key(&engine, "b"), &HeapValue::Number(1.0)).unwrap();
        engine.set_index(&object, 2, &HeapValue::Number(2.0)).unwrap();
        engine.set_property(&object, &key(&engine, "a"), &HeapValue::Number(3.0)).unwrap();
        engine.set_index(&object, 0, &HeapValue::Number(4.0)).unwrap();

        let keys: Vec<String> = engine
            .own_keys(&object)
            .iter()
            .map(|k| k.to_value().as_string().unwrap())
            .collect();
        assert_eq!(keys, vec!["0", "2", "b", "a"]);
        assert_eq!(
            engine.get_property(&object, &key(&engine, "a")).unwrap().as_number(),
            Some(3.0)
        );
    }

    #[test]
    fn test_array_length_tracks_indices() {
        let engine = HeapEngine::new();
        let array = engine.make_array(&[HeapValue::Number(1.0)]);
        engine.set_index(&array, 4, &HeapValue::Bool(true)).unwrap();
        let length = engine.get_property(&array, &key(&engine, "length")).unwrap();
        assert_eq!(length.as_number(), Some(5.0));

        engine.set_property(&array, &key(&engine, "length"), &HeapValue::Number(1.0)).unwrap();
        assert!(matches!(engine.get_index(&array, 4).unwrap(), HeapValue::Undefined));
    }

    #[test]
    fn test_collect_reclaims_unreachable() {
        let engine = HeapEngine::new();
        let before = engine.live_objects();
        let kept = engine.make_object();
        let dropped = engine.make_object();
        engine.protect(&kept);

        let stats = engine.collect();
        assert_eq!(stats.collected, 1);
        assert!(engine.is_alive(&kept));
        assert!(!engine.is_alive(&dropped));
        assert_eq!(engine.live_objects(), before + 1);

        engine.unprotect(&kept);
        engine.collect();
        assert!(!engine.is_alive(&kept));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let engine = HeapEngine::new();
        let first = engine.make_object();
        engine.collect();
        let second = engine.make_object();
        assert!(!engine.is_alive(&first));
        assert!(engine.is_alive(&second));
        assert!(!engine.strict_equals(&first, &second));
    }

    #[test]
    fn test_private_dropped_on_collect() {
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let engine = HeapEngine::new();
        let dropped = Rc::new(Cell::new(false));
        let object = engine.make_object();
        assert!(engine.set_private(&object, Rc::new(Flag(Rc::clone(&dropped)))));
        assert!(engine.private(&object).is_some());

        engine.collect();
        assert!(dropped.get());
    }

    #[test]
    fn test_teardown_drops_protected_objects() {
        struct Flag(Rc<Cell<usize>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let engine = HeapEngine::new();
        let dropped = Rc::new(Cell::new(0));
        let pinned = engine.make_object();
        engine.protect(&pinned);
        assert!(engine.set_private(&pinned, Rc::new(Flag(Rc::clone(&dropped)))));
        let global = engine.global();
        assert!(engine.set_private(&global, Rc::new(Flag(Rc::clone(&dropped)))));

        engine.collect();
        assert_eq!(dropped.get(), 0);

        engine.teardown();
        assert_eq!(dropped.get(), 2);
        assert_eq!(engine.live_objects(), 0);
        assert!(!engine.is_alive(&pinned));
        assert_eq!(engine.protect_count(&pinned), 0);
    }

    #[test]
    fn test_typed_array_views_share_bytes() {
        let engine = HeapEngine::new();
        let buffer = engine.make_array_buffer(8).unwrap();
        let words = engine
            .make_typed_array(TypedArrayKind::Uint16, &buffer, 2, 2)
            .unwrap();
        engine.set_index(&words, 1, &HeapValue::Number(0x0102 as f64)).unwrap();

        let (data, len) = engine.array_buffer_data(&buffer).unwrap();
        assert_eq!(len, 8);
        let bytes = unsafe { std::slice::from_raw_parts(data, len) };
        assert_eq!(u16::from_ne_bytes([bytes[4], bytes[5]]), 0x0102);
        assert!(matches!(engine.get_index(&words, 2).unwrap(), HeapValue::Undefined));

        let misaligned = engine.make_typed_array(TypedArrayKind::Int32, &buffer, 2, 1);
        assert!(misaligned.is_err());
    }

    #[test]
    fn test_uint8_clamped_rounding() {
        assert_eq!(clamp_u8(-3.0), 0);
        assert_eq!(clamp_u8(300.0), 255);
        assert_eq!(clamp_u8(1.5), 2);
        assert_eq!(clamp_u8(2.5), 2);
        assert_eq!(clamp_u8(2.6), 3);
    }

    #[test]
    fn test_number_string_conversions() {
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(string_to_number(&[]), 0.0);
        assert_eq!(string_to_number(&"  42 ".encode_utf16().collect::<Vec<_>>()), 42.0);
        assert_eq!(string_to_number(&"0x10".encode_utf16().collect::<Vec<_>>()), 16.0);
        assert!(string_to_number(&"abc".encode_utf16().collect::<Vec<_>>()).is_nan());
    }

    #[test]
    fn test_construct_falls_back_to_this() {
        let engine = HeapEngine::new();
        let ctor = engine.make_constructor(
            "Point",
            Rc::new(|engine: &HeapEngine, inv: Invocation<HeapValue>| -> Completion {
                engine.set_property(&inv.this, &HeapValue::string("x"), &HeapValue::Number(1.0))?;
                Ok(HeapValue::Undefined)
            }),
        );
        let instance = engine.construct(&ctor, &[]).unwrap();
        assert!(engine.instance_of(&instance, &ctor).unwrap());
        assert_eq!(
            engine.get_property(&instance, &HeapValue::string("x")).unwrap().as_number(),
            Some(1.0)
        );
    }

    #[test]
    fn test_plain_function_is_not_constructor() {
        let engine = HeapEngine::new();
        let callback: NativeCallback<HeapEngine> =
            Rc::new(|_: &HeapEngine, _: Invocation<HeapValue>| -> JsResult<HeapValue, HeapValue> {
                Ok(HeapValue::Null)
            });
        let function = engine.make_function("f", callback);
        assert_eq!(engine.kind(&function), ValueKind::Function);
        assert!(engine.construct(&function, &[]).is_err());
        assert!(matches!(
            engine.call(&function, &HeapValue::Undefined, &[]).unwrap(),
            HeapValue::Null
        ));
    }

    #[test]
    fn test_evaluate_literals() {
        let engine = HeapEngine::new();
        let eval = |src: &str| engine.evaluate_script(&src.encode_utf16().collect::<Vec<_>>());
        assert_eq!(eval("1.5").unwrap().as_number(), Some(1.5));
        assert_eq!(eval("'hi'").unwrap().as_string().as_deref(), Some("hi"));
        assert_eq!(eval("throw 'boom'").unwrap_err().as_string().as_deref(), Some("boom"));
        assert!(eval("let x = 1").is_err());
    }

    #[test]
    fn test_date_to_string() {
        let engine = HeapEngine::new();
        let date = engine.make_date(0.0);
        let text = String::from_utf16(&engine.to_string(&date).unwrap()).unwrap();
        assert_eq!(text, "1970-01-01T00:00:00.000Z");
    }
}
