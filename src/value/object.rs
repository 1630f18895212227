//! Objects, arrays, property access and invocation.

use crate::engine::{Engine, ValueKind};
use crate::env::Env;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::ops::BitOr;

/// Whether key collection walks the prototype chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCollectionMode {
    /// Own keys, then each prototype's, skipping shadowed keys
    IncludePrototypes,
    /// Own keys only
    OwnOnly,
}

/// Attribute and key-type filter for [`Env::get_all_property_names`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyFilter(u32);

impl KeyFilter {
    /// No filtering
    pub const ALL_PROPERTIES: Self = Self(0);
    /// Only writable data properties
    pub const WRITABLE: Self = Self(1);
    /// Only enumerable properties
    pub const ENUMERABLE: Self = Self(1 << 1);
    /// Only configurable properties
    pub const CONFIGURABLE: Self = Self(1 << 2);
    /// Drop string keys
    pub const SKIP_STRINGS: Self = Self(1 << 3);
    /// Drop symbol keys
    pub const SKIP_SYMBOLS: Self = Self(1 << 4);

    /// Raw ABI bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// From raw ABI bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for KeyFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How index-like keys are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyConversion {
    /// Array indices come back as numbers
    KeepNumbers,
    /// Every string key comes back as a string
    NumbersToStrings,
}

/// Canonical array index spelled by `text`, if any
fn array_index(text: &str) -> Option<u32> {
    let index: u32 = text.parse().ok()?;
    (index != u32::MAX && index.to_string() == text).then_some(index)
}

impl<E: Engine> Env<E> {
    /// ToObject for property access; `undefined` and `null` are rejected
    fn object_of(&self, value: &E::Value) -> Result<E::Value> {
        match self.engine().kind(value) {
            ValueKind::Undefined | ValueKind::Null => Err(Error::ObjectExpected),
            ValueKind::Object | ValueKind::Function => Ok(value.clone()),
            _ => self.capture(self.engine().to_object(value)),
        }
    }

    /// `Object[name]`
    fn object_static(&self, name: &str) -> Result<E::Value> {
        let object_constructor = self.global_named("Object")?;
        self.named_property(&object_constructor, name)
    }

    /// Elements of an engine array
    pub(crate) fn array_elements(&self, array: &E::Value) -> Result<Vec<E::Value>> {
        let length = self.named_property(array, "length")?;
        let length = self.capture(self.engine().to_number(&length))? as u32;
        (0..length)
            .map(|index| self.capture(self.engine().get_index(array, index)))
            .collect()
    }

    /// Empty ordinary object
    pub fn create_object(&self) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().make_object()))
    }

    /// Empty array
    pub fn create_array(&self) -> Result<E::Value> {
        self.entry(|| Ok(self.engine().make_array(&[])))
    }

    /// Array with its `length` preset
    pub fn create_array_with_length(&self, length: u32) -> Result<E::Value> {
        self.entry(|| {
            let array = self.engine().make_array(&[]);
            let length = self.engine().number(f64::from(length));
            self.capture(self.engine().set_property(&array, &self.name("length"), &length))?;
            Ok(array)
        })
    }

    /// `array.length`
    pub fn get_array_length(&self, array: &E::Value) -> Result<u32> {
        self.entry(|| {
            if !self.engine().is_array(array) {
                return Err(Error::ArrayExpected);
            }
            let length = self.named_property(array, "length")?;
            Ok(self.capture(self.engine().to_number(&length))? as u32)
        })
    }

    /// `Array.isArray(value)`
    pub fn is_array(&self, value: &E::Value) -> Result<bool> {
        self.entry(|| Ok(self.engine().is_array(value)))
    }

    /// `Object.getPrototypeOf(object)`
    pub fn get_prototype(&self, object: &E::Value) -> Result<E::Value> {
        self.entry(|| {
            let object = self.object_of(object)?;
            Ok(self.engine().prototype(&object))
        })
    }

    /// `object[key] = value`
    pub fn set_property(&self, object: &E::Value, key: &E::Value, value: &E::Value) -> Result<()> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().set_property(&object, key, value))
        })
    }

    /// `object[key]`
    pub fn get_property(&self, object: &E::Value, key: &E::Value) -> Result<E::Value> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().get_property(&object, key))
        })
    }

    /// `key in object`
    pub fn has_property(&self, object: &E::Value, key: &E::Value) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().has_property(&object, key))
        })
    }

    /// `delete object[key]`
    pub fn delete_property(&self, object: &E::Value, key: &E::Value) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().delete_property(&object, key))
        })
    }

    /// `object.hasOwnProperty(key)`; the key must be a string or symbol
    pub fn has_own_property(&self, object: &E::Value, key: &E::Value) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            if !matches!(self.engine().kind(key), ValueKind::String | ValueKind::Symbol) {
                return Err(Error::NameExpected);
            }
            let prototype = self.named_property(&self.global_named("Object")?, "prototype")?;
            let has_own = self.named_property(&prototype, "hasOwnProperty")?;
            let found = self.capture(self.engine().call(&has_own, &object, &[key.clone()]))?;
            Ok(self.engine().to_boolean(&found))
        })
    }

    /// `object[name] = value` with a UTF-8 name
    pub fn set_named_property(
        &self,
        object: &E::Value,
        name: &str,
        value: &E::Value,
    ) -> Result<()> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().set_property(&object, &self.name(name), value))
        })
    }

    /// `object[name]` with a UTF-8 name
    pub fn get_named_property(&self, object: &E::Value, name: &str) -> Result<E::Value> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.named_property(&object, name)
        })
    }

    /// `name in object` with a UTF-8 name
    pub fn has_named_property(&self, object: &E::Value, name: &str) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().has_property(&object, &self.name(name)))
        })
    }

    /// `object[index] = value`
    pub fn set_element(&self, object: &E::Value, index: u32, value: &E::Value) -> Result<()> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().set_index(&object, index, value))
        })
    }

    /// `object[index]`
    pub fn get_element(&self, object: &E::Value, index: u32) -> Result<E::Value> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            self.capture(self.engine().get_index(&object, index))
        })
    }

    /// `index in object`
    pub fn has_element(&self, object: &E::Value, index: u32) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            let key = self.engine().number(f64::from(index));
            self.capture(self.engine().has_property(&object, &key))
        })
    }

    /// `delete object[index]`
    pub fn delete_element(&self, object: &E::Value, index: u32) -> Result<bool> {
        self.entry_js(|| {
            let object = self.object_of(object)?;
            let key = self.engine().number(f64::from(index));
            self.capture(self.engine().delete_property(&object, &key))
        })
    }

    /// Enumerable string keys, own and inherited, as strings
    pub fn get_property_names(&self, object: &E::Value) -> Result<E::Value> {
        self.get_all_property_names(
            object,
            KeyCollectionMode::IncludePrototypes,
            KeyFilter::ENUMERABLE | KeyFilter::SKIP_SYMBOLS,
            KeyConversion::NumbersToStrings,
        )
    }

    /// Collect property keys.
    ///
    /// Each level reports its string keys before its symbols. A key seen on
    /// an earlier level shadows the same key further up the chain, even when
    /// the nearer property was filtered out.
    pub fn get_all_property_names(
        &self,
        object: &E::Value,
        mode: KeyCollectionMode,
        filter: KeyFilter,
        conversion: KeyConversion,
    ) -> Result<E::Value> {
        self.entry_js(|| {
            let engine = self.engine();
            let mut current = self.object_of(object)?;
            let names_of = self.object_static("getOwnPropertyNames")?;
            let symbols_of = self.object_static("getOwnPropertySymbols")?;
            let descriptor_of = self.object_static("getOwnPropertyDescriptor")?;
            let undefined = engine.undefined();

            let mut seen_names: HashSet<Vec<u16>> = HashSet::new();
            // Symbols compare by identity only
            let mut seen_symbols: Vec<E::Value> = Vec::new();
            let mut keys = Vec::new();
            loop {
                let mut level = Vec::new();
                if !filter.contains(KeyFilter::SKIP_STRINGS) {
                    let names =
                        self.capture(engine.call(&names_of, &undefined, &[current.clone()]))?;
                    level.extend(self.array_elements(&names)?);
                }
                if !filter.contains(KeyFilter::SKIP_SYMBOLS) {
                    let symbols =
                        self.capture(engine.call(&symbols_of, &undefined, &[current.clone()]))?;
                    level.extend(self.array_elements(&symbols)?);
                }

                for key in level {
                    let name = if engine.kind(&key) == ValueKind::Symbol {
                        if seen_symbols.iter().any(|known| engine.strict_equals(known, &key)) {
                            continue;
                        }
                        seen_symbols.push(key.clone());
                        None
                    } else {
                        let units = self.capture(engine.to_string(&key))?;
                        if !seen_names.insert(units.clone()) {
                            continue;
                        }
                        Some(units)
                    };

                    let descriptor = self.capture(engine.call(
                        &descriptor_of,
                        &undefined,
                        &[current.clone(), key.clone()],
                    ))?;
                    let flag = |name: &str| -> Result<bool> {
                        let value = self.named_property(&descriptor, name)?;
                        Ok(engine.to_boolean(&value))
                    };
                    if (filter.contains(KeyFilter::WRITABLE) && !flag("writable")?)
                        || (filter.contains(KeyFilter::ENUMERABLE) && !flag("enumerable")?)
                        || (filter.contains(KeyFilter::CONFIGURABLE) && !flag("configurable")?)
                    {
                        continue;
                    }

                    let key = match (conversion, name) {
                        (KeyConversion::KeepNumbers, Some(units)) => {
                            match array_index(&String::from_utf16_lossy(&units)) {
                                Some(index) => engine.number(f64::from(index)),
                                None => key,
                            }
                        }
                        _ => key,
                    };
                    keys.push(key);
                }

                if mode == KeyCollectionMode::OwnOnly {
                    break;
                }
                current = engine.prototype(&current);
                if !matches!(engine.kind(&current), ValueKind::Object | ValueKind::Function) {
                    break;
                }
            }
            Ok(engine.make_array(&keys))
        })
    }

    /// `Object.freeze(object)`
    pub fn object_freeze(&self, object: &E::Value) -> Result<()> {
        self.entry_js(|| {
            self.expect_object(object)?;
            let freeze = self.object_static("freeze")?;
            let undefined = self.engine().undefined();
            self.capture(self.engine().call(&freeze, &undefined, &[object.clone()]))?;
            Ok(())
        })
    }

    /// `Object.seal(object)`
    pub fn object_seal(&self, object: &E::Value) -> Result<()> {
        self.entry_js(|| {
            self.expect_object(object)?;
            let seal = self.object_static("seal")?;
            self.capture(self.engine().call(&seal, &self.engine().undefined(), &[object.clone()]))?;
            Ok(())
        })
    }

    /// `object instanceof constructor`
    pub fn instanceof(&self, object: &E::Value, constructor: &E::Value) -> Result<bool> {
        self.entry_js(|| {
            self.expect_kind(constructor, ValueKind::Function, Error::FunctionExpected)?;
            self.capture(self.engine().instance_of(object, constructor))
        })
    }

    /// Call `function` with `recv` as `this`
    pub fn call_function(
        &self,
        recv: &E::Value,
        function: &E::Value,
        args: &[E::Value],
    ) -> Result<E::Value> {
        self.entry_js(|| {
            self.expect_kind(function, ValueKind::Function, Error::FunctionExpected)?;
            self.capture(self.engine().call(function, recv, args))
        })
    }

    /// `new constructor(...args)`
    pub fn new_instance(&self, constructor: &E::Value, args: &[E::Value]) -> Result<E::Value> {
        self.entry_js(|| {
            self.expect_kind(constructor, ValueKind::Function, Error::FunctionExpected)?;
            self.capture(self.engine().construct(constructor, args))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::heap::HeapValue;
    use crate::env::test_support::test_env;

    fn strings(env: &Env<crate::engine::heap::HeapEngine>, array: &HeapValue) -> Vec<HeapValue> {
        env.array_elements(array).unwrap()
    }

    #[test]
    fn test_array_index_spelling() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("42"), Some(42));
        assert_eq!(array_index("042"), None);
        assert_eq!(array_index("4294967295"), None);
        assert_eq!(array_index("-1"), None);
    }

    #[test]
    fn test_property_round_trip() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let key = env.create_string_utf8(b"k").unwrap();
        let value = env.create_int32(5).unwrap();

        env.set_property(&object, &key, &value).unwrap();
        assert!(env.has_property(&object, &key).unwrap());
        assert!(env.has_named_property(&object, "k").unwrap());
        assert_eq!(env.get_property(&object, &key).unwrap(), HeapValue::Number(5.0));
        assert!(env.has_own_property(&object, &key).unwrap());

        assert!(env.delete_property(&object, &key).unwrap());
        assert!(!env.has_property(&object, &key).unwrap());
        assert_eq!(env.get_named_property(&object, "k").unwrap(), HeapValue::Undefined);

        let number = env.create_int32(1).unwrap();
        assert_eq!(env.has_own_property(&object, &number), Err(Error::NameExpected));
        let undefined = env.get_undefined().unwrap();
        assert_eq!(env.get_property(&undefined, &key), Err(Error::ObjectExpected));
    }

    #[test]
    fn test_arrays_and_elements() {
        let (env, _executor) = test_env();
        let array = env.create_array_with_length(3).unwrap();
        assert!(env.is_array(&array).unwrap());
        assert_eq!(env.get_array_length(&array).unwrap(), 3);

        let value = env.create_int32(9).unwrap();
        env.set_element(&array, 5, &value).unwrap();
        assert_eq!(env.get_array_length(&array).unwrap(), 6);
        assert!(env.has_element(&array, 5).unwrap());
        assert!(!env.has_element(&array, 1).unwrap());
        assert_eq!(env.get_element(&array, 5).unwrap(), HeapValue::Number(9.0));
        assert!(env.delete_element(&array, 5).unwrap());
        assert!(!env.has_element(&array, 5).unwrap());

        let object = env.create_object().unwrap();
        assert_eq!(env.get_array_length(&object), Err(Error::ArrayExpected));
    }

    #[test]
    fn test_property_names_walk_prototypes() {
        let (env, _executor) = test_env();
        let null = env.get_null().unwrap();
        let base = env.create_object().unwrap();
        env.engine().set_prototype(&base, &null).unwrap();
        let two = env.create_int32(2).unwrap();
        env.set_named_property(&base, "b", &two).unwrap();
        env.set_named_property(&base, "a", &two).unwrap();

        let object = env.create_object().unwrap();
        env.engine().set_prototype(&object, &base).unwrap();
        let one = env.create_int32(1).unwrap();
        env.set_named_property(&object, "a", &one).unwrap();

        let names = env.get_property_names(&object).unwrap();
        assert_eq!(strings(&env, &names), vec![HeapValue::string("a"), HeapValue::string("b")]);

        let own = env
            .get_all_property_names(
                &object,
                KeyCollectionMode::OwnOnly,
                KeyFilter::ALL_PROPERTIES,
                KeyConversion::NumbersToStrings,
            )
            .unwrap();
        assert_eq!(strings(&env, &own), vec![HeapValue::string("a")]);
    }

    #[test]
    fn test_property_names_deep_chain_reports_each_key_once() {
        let (env, _executor) = test_env();
        let value = env.create_int32(1).unwrap();
        let symbol = env.create_symbol(None).unwrap();

        let mut current = env.create_object().unwrap();
        let null = env.get_null().unwrap();
        env.engine().set_prototype(&current, &null).unwrap();
        for level in 0..64 {
            env.set_named_property(&current, "shared", &value).unwrap();
            env.set_named_property(&current, &format!("level{}", level), &value).unwrap();
            env.set_property(&current, &symbol, &value).unwrap();
            let child = env.create_object().unwrap();
            env.engine().set_prototype(&child, &current).unwrap();
            current = child;
        }

        let names = env
            .get_all_property_names(
                &current,
                KeyCollectionMode::IncludePrototypes,
                KeyFilter::ALL_PROPERTIES,
                KeyConversion::NumbersToStrings,
            )
            .unwrap();
        let names = strings(&env, &names);
        assert_eq!(names.len(), 66);
        assert_eq!(names[0], HeapValue::string("shared"));
        assert_eq!(names[1], HeapValue::string("level63"));
        assert_eq!(names[2], symbol);
        assert_eq!(names[3], HeapValue::string("level62"));
        assert_eq!(names[65], HeapValue::string("level0"));
    }

    #[test]
    fn test_property_names_filters() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let value = env.create_int32(1).unwrap();
        env.set_element(&object, 3, &value).unwrap();
        env.set_named_property(&object, "name", &value).unwrap();
        let symbol = env.create_symbol(None).unwrap();
        env.set_property(&object, &symbol, &value).unwrap();
        env.object_freeze(&object).unwrap();

        let keep_numbers = env
            .get_all_property_names(
                &object,
                KeyCollectionMode::OwnOnly,
                KeyFilter::ENUMERABLE,
                KeyConversion::KeepNumbers,
            )
            .unwrap();
        assert_eq!(
            strings(&env, &keep_numbers),
            vec![HeapValue::Number(3.0), HeapValue::string("name"), symbol.clone()]
        );

        let symbols_only = env
            .get_all_property_names(
                &object,
                KeyCollectionMode::OwnOnly,
                KeyFilter::SKIP_STRINGS,
                KeyConversion::KeepNumbers,
            )
            .unwrap();
        assert_eq!(strings(&env, &symbols_only), vec![symbol]);

        let writable = env
            .get_all_property_names(
                &object,
                KeyCollectionMode::OwnOnly,
                KeyFilter::WRITABLE,
                KeyConversion::KeepNumbers,
            )
            .unwrap();
        assert!(strings(&env, &writable).is_empty());
    }

    #[test]
    fn test_freeze_and_seal() {
        let (env, _executor) = test_env();
        let frozen = env.create_object().unwrap();
        let one = env.create_int32(1).unwrap();
        let two = env.create_int32(2).unwrap();
        env.set_named_property(&frozen, "x", &one).unwrap();
        env.object_freeze(&frozen).unwrap();
        env.set_named_property(&frozen, "x", &two).unwrap();
        env.set_named_property(&frozen, "y", &two).unwrap();
        assert_eq!(env.get_named_property(&frozen, "x").unwrap(), HeapValue::Number(1.0));
        assert!(!env.has_named_property(&frozen, "y").unwrap());

        let sealed = env.create_object().unwrap();
        env.set_named_property(&sealed, "x", &one).unwrap();
        env.object_seal(&sealed).unwrap();
        env.set_named_property(&sealed, "x", &two).unwrap();
        env.set_named_property(&sealed, "y", &two).unwrap();
        assert_eq!(env.get_named_property(&sealed, "x").unwrap(), HeapValue::Number(2.0));
        assert!(!env.has_named_property(&sealed, "y").unwrap());
    }

    #[test]
    fn test_call_requires_function() {
        let (env, _executor) = test_env();
        let object = env.create_object().unwrap();
        let undefined = env.get_undefined().unwrap();
        assert_eq!(
            env.call_function(&undefined, &object, &[]),
            Err(Error::FunctionExpected)
        );
        assert_eq!(env.new_instance(&object, &[]), Err(Error::FunctionExpected));
        assert_eq!(env.instanceof(&object, &object), Err(Error::FunctionExpected));

        let prototype = env.get_prototype(&object).unwrap();
        let object_constructor = env.get_named_property(&prototype, "constructor").unwrap();
        assert!(env.instanceof(&object, &object_constructor).unwrap());
    }
}
