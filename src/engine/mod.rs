//! Script engine contract.
//!
//! The bridge is written against the [`Engine`] trait: the handful of
//! primitives an embeddable engine exposes (values, objects, callable host
//! functions, a protect/unprotect pinning model, an identity-keyed private
//! slot and array-buffer storage). Everything else the ABI needs, including
//! property descriptors, bigints, promises, weak maps and finalization
//! registries, is reached through the engine's global scope.
//!
//! Engine exceptions are returned as `Err(value)`; the bridge moves them into
//! the environment's pending-exception slot.

#[cfg(any(test, feature = "test-engine"))]
pub mod heap;

use std::any::Any;
use std::fmt::Debug;
use std::rc::Rc;

/// Result of an engine operation that may throw
pub type JsResult<T, V> = std::result::Result<T, V>;

/// Host function body installed into the engine.
///
/// Returning `Err` throws the value into the calling script.
pub type NativeCallback<E> = Rc<
    dyn Fn(
        &E,
        Invocation<<E as Engine>::Value>,
    ) -> JsResult<<E as Engine>::Value, <E as Engine>::Value>,
>;

/// Arguments of one host-function invocation
#[derive(Debug, Clone)]
pub struct Invocation<V> {
    /// The function object being invoked
    pub callee: V,
    /// Receiver
    pub this: V,
    /// Positional arguments
    pub args: Vec<V>,
    /// Constructor being invoked with `new`, `None` for plain calls
    pub new_target: Option<V>,
}

/// Result of `typeof`-style inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean primitive
    Boolean,
    /// Number primitive
    Number,
    /// String primitive
    String,
    /// Symbol primitive
    Symbol,
    /// BigInt primitive
    BigInt,
    /// Non-callable object
    Object,
    /// Callable object
    Function,
}

/// Element type of a typed array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    /// `Int8Array`
    Int8,
    /// `Uint8Array`
    Uint8,
    /// `Uint8ClampedArray`
    Uint8Clamped,
    /// `Int16Array`
    Int16,
    /// `Uint16Array`
    Uint16,
    /// `Int32Array`
    Int32,
    /// `Uint32Array`
    Uint32,
    /// `Float32Array`
    Float32,
    /// `Float64Array`
    Float64,
    /// `BigInt64Array`
    BigInt64,
    /// `BigUint64Array`
    BigUint64,
}

impl TypedArrayKind {
    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }

    /// Constructor name in the global scope
    pub fn name(self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
        }
    }
}

/// Buffer classification of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Not a buffer
    None,
    /// An `ArrayBuffer`
    ArrayBuffer,
    /// A typed array view
    TypedArray(TypedArrayKind),
}

/// Metadata of a typed array view
#[derive(Debug, Clone)]
pub struct TypedArrayInfo<V> {
    /// Element type
    pub kind: TypedArrayKind,
    /// Length in elements
    pub length: usize,
    /// Backing `ArrayBuffer`
    pub buffer: V,
    /// Offset of the first element in the backing buffer, in bytes
    pub byte_offset: usize,
}

/// Operations the bridge needs from an embeddable script engine.
///
/// All methods take `&self`; engines use interior mutability and must allow
/// re-entry from inside a [`NativeCallback`] or a private-slot destructor.
pub trait Engine: 'static {
    /// Engine value handle
    type Value: Clone + Debug + 'static;

    /// `undefined`
    fn undefined(&self) -> Self::Value;
    /// `null`
    fn null(&self) -> Self::Value;
    /// Boolean primitive
    fn boolean(&self, value: bool) -> Self::Value;
    /// Number primitive
    fn number(&self, value: f64) -> Self::Value;
    /// String primitive from UTF-16 code units
    fn string(&self, units: &[u16]) -> Self::Value;
    /// Fresh symbol
    fn symbol(&self, description: Option<&[u16]>) -> Self::Value;

    /// Classify a value
    fn kind(&self, value: &Self::Value) -> ValueKind;
    /// ECMAScript ToNumber
    fn to_number(&self, value: &Self::Value) -> JsResult<f64, Self::Value>;
    /// ECMAScript ToBoolean
    fn to_boolean(&self, value: &Self::Value) -> bool;
    /// ECMAScript ToString, as UTF-16 code units
    fn to_string(&self, value: &Self::Value) -> JsResult<Vec<u16>, Self::Value>;
    /// ECMAScript ToObject
    fn to_object(&self, value: &Self::Value) -> JsResult<Self::Value, Self::Value>;
    /// `===`
    fn strict_equals(&self, a: &Self::Value, b: &Self::Value) -> bool;
    /// Whether the value is an `Array`
    fn is_array(&self, value: &Self::Value) -> bool;
    /// Whether the value is a `Date`
    fn is_date(&self, value: &Self::Value) -> bool;
    /// `instanceof`
    fn instance_of(
        &self,
        value: &Self::Value,
        constructor: &Self::Value,
    ) -> JsResult<bool, Self::Value>;

    /// The global object
    fn global(&self) -> Self::Value;
    /// Empty ordinary object
    fn make_object(&self) -> Self::Value;
    /// Array holding `elements`
    fn make_array(&self, elements: &[Self::Value]) -> Self::Value;
    /// Date with the given time value in milliseconds
    fn make_date(&self, time: f64) -> Self::Value;
    /// Callable host function
    fn make_function(&self, name: &str, callback: NativeCallback<Self>) -> Self::Value
    where
        Self: Sized;
    /// Constructible host function with a fresh `prototype` object
    fn make_constructor(&self, name: &str, callback: NativeCallback<Self>) -> Self::Value
    where
        Self: Sized;
    /// Call `function` with `this` and `args`
    fn call(
        &self,
        function: &Self::Value,
        this: &Self::Value,
        args: &[Self::Value],
    ) -> JsResult<Self::Value, Self::Value>;
    /// `new constructor(...args)`
    fn construct(
        &self,
        constructor: &Self::Value,
        args: &[Self::Value],
    ) -> JsResult<Self::Value, Self::Value>;

    /// `object[key]`
    fn get_property(
        &self,
        object: &Self::Value,
        key: &Self::Value,
    ) -> JsResult<Self::Value, Self::Value>;
    /// `object[key] = value`
    fn set_property(
        &self,
        object: &Self::Value,
        key: &Self::Value,
        value: &Self::Value,
    ) -> JsResult<(), Self::Value>;
    /// `key in object`
    fn has_property(&self, object: &Self::Value, key: &Self::Value)
        -> JsResult<bool, Self::Value>;
    /// `delete object[key]`
    fn delete_property(
        &self,
        object: &Self::Value,
        key: &Self::Value,
    ) -> JsResult<bool, Self::Value>;
    /// `object[index]`
    fn get_index(&self, object: &Self::Value, index: u32) -> JsResult<Self::Value, Self::Value>;
    /// `object[index] = value`
    fn set_index(
        &self,
        object: &Self::Value,
        index: u32,
        value: &Self::Value,
    ) -> JsResult<(), Self::Value>;
    /// `Object.getPrototypeOf(object)`
    fn prototype(&self, object: &Self::Value) -> Self::Value;
    /// `Object.setPrototypeOf(object, prototype)`
    fn set_prototype(
        &self,
        object: &Self::Value,
        prototype: &Self::Value,
    ) -> JsResult<(), Self::Value>;

    /// Host data attached to `object`, keyed by object identity
    fn private(&self, object: &Self::Value) -> Option<Rc<dyn Any>>;
    /// Attach host data to `object`. Returns false for primitives.
    ///
    /// The engine drops the data when it reclaims the object.
    fn set_private(&self, object: &Self::Value, data: Rc<dyn Any>) -> bool;

    /// Reclaim every object of the context, protected or not.
    ///
    /// Private-slot data and external buffer releases are dropped before
    /// this returns. Called once while the owning environment is still
    /// alive; the context is unusable afterwards.
    fn teardown(&self);

    /// Pin a value against collection. Counted.
    fn protect(&self, value: &Self::Value);
    /// Undo one [`Engine::protect`]
    fn unprotect(&self, value: &Self::Value);

    /// Buffer classification
    fn buffer_kind(&self, value: &Self::Value) -> BufferKind;
    /// Zero-filled `ArrayBuffer`
    fn make_array_buffer(&self, byte_length: usize) -> JsResult<Self::Value, Self::Value>;
    /// `ArrayBuffer` over caller-owned memory; `release` runs when reclaimed
    fn make_external_array_buffer(
        &self,
        data: *mut u8,
        byte_length: usize,
        release: Box<dyn FnOnce()>,
    ) -> JsResult<Self::Value, Self::Value>;
    /// Base pointer and length of an `ArrayBuffer`
    fn array_buffer_data(&self, buffer: &Self::Value) -> Option<(*mut u8, usize)>;
    /// Typed array view over `buffer`
    fn make_typed_array(
        &self,
        kind: TypedArrayKind,
        buffer: &Self::Value,
        byte_offset: usize,
        length: usize,
    ) -> JsResult<Self::Value, Self::Value>;
    /// Metadata of a typed array view
    fn typed_array_info(&self, value: &Self::Value) -> Option<TypedArrayInfo<Self::Value>>;

    /// Evaluate a script in the global scope
    fn evaluate_script(&self, source: &[u16]) -> JsResult<Self::Value, Self::Value>;
}

/// UTF-16 code units of a Rust string
pub fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

/// ECMAScript ToInt32 on an already converted number
pub fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let wrapped = value.trunc() % 4_294_967_296.0;
    let wrapped = if wrapped < 0.0 {
        wrapped + 4_294_967_296.0
    } else {
        wrapped
    };
    wrapped as u32 as i32
}

/// ECMAScript ToUint32 on an already converted number
pub fn to_uint32(value: f64) -> u32 {
    to_int32(value) as u32
}
