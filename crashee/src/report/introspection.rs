// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Describes what raw addresses found in registers, on the stack or in exception reasons point
//! to.
//!
//! An address can be a plain C string, found by reading memory through [copy_max_possible], or
//! an object of an embedding runtime, recognised by whatever [ObjectIntrospector] the runtime
//! registered. Objects are dumped field by field, recursively, within a budget shared by the
//! whole dump.

use super::writer::ReportWriter;
use crate::collector::memory::copy_max_possible;
use crate::shared::constants::{
    MAX_INTROSPECTED_IVARS, MAX_INTROSPECTED_STRING_LENGTH, MAX_STRING_CHECK_LENGTH,
    MIN_STRING_LENGTH,
};
use crate::shared::fields::{self, memory_type};
use std::sync::OnceLock;

/// What a runtime knows an address to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Unknown,
    Class,
    Object,
    Block,
}

/// Specialisation of an object, for the kinds whose contents are written in a dedicated way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Unknown,
    String,
    Date,
    Url,
    Array,
    Dictionary,
    Number,
    Exception,
}

/// One instance variable of an object.
///
/// `type_code` follows the usual one character type encoding: `c i s l q` signed integers,
/// `C I S L Q` unsigned integers, `f d` floating point, `B` boolean and `* @ # :` pointers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ivar<'a> {
    pub name: &'a str,
    pub type_code: u8,
    pub index: usize,
}

/// Object introspection of an embedding runtime.
///
/// Every method receives an untrusted address and must read the memory behind it through
/// [crate::collector::memory::copy_safely]. Implementations run on the crash path: they must not
/// allocate or lock.
pub trait ObjectIntrospector: Sync {
    fn object_kind(&self, address: usize) -> ObjectKind;

    /// For a class, its own name; for an object or block, the name of its class.
    fn class_name(&self, address: usize) -> Option<&str>;

    fn class_kind(&self, _address: usize) -> ClassKind {
        ClassKind::Unknown
    }

    fn is_tagged_pointer(&self, _address: usize) -> bool {
        false
    }

    fn is_valid_tagged_pointer(&self, _address: usize) -> bool {
        false
    }

    fn tagged_pointer_payload(&self, _address: usize) -> i64 {
        0
    }

    /// Copies the text of a string or URL object into `buffer`, returning its length.
    fn string_contents(&self, _address: usize, _buffer: &mut [u8]) -> Option<usize> {
        None
    }

    fn date_contents(&self, _address: usize) -> f64 {
        0.0
    }

    fn number_as_float(&self, _address: usize) -> f64 {
        0.0
    }

    fn array_first_object(&self, _address: usize) -> Option<usize> {
        None
    }

    /// Fills `ivars` with the instance variables of the object's class and returns how many
    /// were written.
    fn ivars<'s>(&'s self, _address: usize, _ivars: &mut [Ivar<'s>]) -> usize {
        0
    }

    /// Copies the raw value of ivar `index` into `value`, sized for its type.
    fn ivar_value(&self, _address: usize, _index: usize, _value: &mut [u8]) -> bool {
        false
    }
}

/// The introspector used when no runtime registered one. It knows no objects.
pub struct NoRuntime;

impl ObjectIntrospector for NoRuntime {
    fn object_kind(&self, _address: usize) -> ObjectKind {
        ObjectKind::Unknown
    }

    fn class_name(&self, _address: usize) -> Option<&str> {
        None
    }
}

static INTROSPECTOR: OnceLock<&'static dyn ObjectIntrospector> = OnceLock::new();

/// Registers the introspector of the embedding runtime. Only the first registration counts.
pub fn register_introspector(introspector: &'static dyn ObjectIntrospector) -> bool {
    INTROSPECTOR.set(introspector).is_ok()
}

pub fn introspector() -> &'static dyn ObjectIntrospector {
    INTROSPECTOR.get().copied().unwrap_or(&NoRuntime)
}

/// Whether memory is introspected, and which classes are only ever written by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntrospectionRules {
    pub enabled: bool,
    pub excluded_classes: Vec<String>,
}

impl IntrospectionRules {
    pub const fn new() -> Self {
        Self {
            enabled: true,
            excluded_classes: Vec::new(),
        }
    }

    pub fn is_excluded(&self, class_name: &str) -> bool {
        self.excluded_classes.iter().any(|c| c == class_name)
    }
}

/// Writes descriptions of addresses into a report.
pub struct MemoryIntrospection<'a> {
    pub runtime: &'a dyn ObjectIntrospector,
    pub rules: &'a IntrospectionRules,
}

impl MemoryIntrospection<'_> {
    fn is_valid_pointer(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }
        !self.runtime.is_tagged_pointer(address) || self.runtime.is_valid_tagged_pointer(address)
    }

    /// Whether `address` points to a runtime object or to a readable string.
    pub fn is_notable(&self, address: usize) -> bool {
        self.is_valid_pointer(address)
            && (self.runtime.object_kind(address) != ObjectKind::Unknown
                || is_valid_string(address))
    }

    /// Writes an object describing `address` under `key`, recursing into referenced objects
    /// while `limit` stays positive. Every object and field visited decrements `limit`.
    pub fn write_memory_contents(
        &self,
        writer: &mut dyn ReportWriter,
        key: Option<&str>,
        address: usize,
        limit: &mut i32,
    ) {
        *limit -= 1;
        writer.begin_object(key);
        writer.add_uinteger_element(Some(fields::ADDRESS), address as u64);
        if !self.write_runtime_object(writer, address, limit) {
            let mut buffer = [0u8; MAX_STRING_CHECK_LENGTH];
            if address == 0 {
                writer.add_string_element(Some(fields::TYPE), memory_type::NULL_POINTER);
            } else if let Some(text) = read_valid_string(address, &mut buffer) {
                writer.add_string_element(Some(fields::TYPE), memory_type::STRING);
                writer.add_string_element(Some(fields::VALUE), text);
            } else {
                writer.add_string_element(Some(fields::TYPE), memory_type::UNKNOWN);
            }
        }
        writer.end_container();
    }

    /// Writes `address` only if it is notable, with a fresh budget.
    pub fn write_memory_contents_if_notable(
        &self,
        writer: &mut dyn ReportWriter,
        key: Option<&str>,
        address: usize,
        search_depth: i32,
    ) {
        if self.is_notable(address) {
            let mut limit = search_depth;
            self.write_memory_contents(writer, key, address, &mut limit);
        }
    }

    /// Looks for a hex address in `text` and writes whatever it references.
    pub fn write_address_referenced_by_string(
        &self,
        writer: &mut dyn ReportWriter,
        key: Option<&str>,
        text: Option<&str>,
        search_depth: i32,
    ) {
        let Some(address) = text.and_then(extract_hex_value) else {
            return;
        };
        let mut limit = search_depth;
        self.write_memory_contents(writer, key, address as usize, &mut limit);
    }

    fn write_runtime_object(
        &self,
        writer: &mut dyn ReportWriter,
        address: usize,
        limit: &mut i32,
    ) -> bool {
        let class_name = self.runtime.class_name(address).unwrap_or_default();
        match self.runtime.object_kind(address) {
            ObjectKind::Unknown => false,
            ObjectKind::Class => {
                writer.add_string_element(Some(fields::TYPE), memory_type::CLASS);
                writer.add_string_element(Some(fields::CLASS), class_name);
                true
            }
            ObjectKind::Block => {
                writer.add_string_element(Some(fields::TYPE), memory_type::BLOCK);
                writer.add_string_element(Some(fields::CLASS), class_name);
                true
            }
            ObjectKind::Object => {
                writer.add_string_element(Some(fields::TYPE), memory_type::OBJECT);
                writer.add_string_element(Some(fields::CLASS), class_name);
                if !self.rules.is_excluded(class_name) {
                    self.write_object_contents(writer, address, limit);
                }
                true
            }
        }
    }

    fn write_object_contents(&self, writer: &mut dyn ReportWriter, address: usize, limit: &mut i32) {
        match self.runtime.class_kind(address) {
            ClassKind::String | ClassKind::Url => {
                let mut buffer = [0u8; MAX_INTROSPECTED_STRING_LENGTH];
                if let Some(len) = self.runtime.string_contents(address, &mut buffer) {
                    let text = &buffer[..len.min(buffer.len())];
                    // Keeps the valid prefix, as converting the rest would allocate.
                    let valid = match std::str::from_utf8(text) {
                        Ok(text) => text,
                        Err(e) => std::str::from_utf8(&text[..e.valid_up_to()]).unwrap_or_default(),
                    };
                    writer.add_string_element(Some(fields::VALUE), valid);
                }
            }
            ClassKind::Date => {
                writer.add_floating_point_element(Some(fields::VALUE), self.runtime.date_contents(address));
            }
            ClassKind::Number => {
                writer.add_floating_point_element(Some(fields::VALUE), self.runtime.number_as_float(address));
            }
            ClassKind::Array => {
                if *limit > 0 {
                    if let Some(first) = self.runtime.array_first_object(address) {
                        self.write_memory_contents(writer, Some(fields::FIRST_OBJECT), first, limit);
                    }
                }
            }
            ClassKind::Dictionary | ClassKind::Exception | ClassKind::Unknown => {
                if *limit > 0 {
                    self.write_unknown_object_contents(writer, Some(fields::IVARS), address, limit);
                }
            }
        }
    }

    fn write_unknown_object_contents(
        &self,
        writer: &mut dyn ReportWriter,
        key: Option<&str>,
        address: usize,
        limit: &mut i32,
    ) {
        *limit -= 1;
        writer.begin_object(key);
        if self.runtime.is_tagged_pointer(address) {
            writer.add_integer_element(
                Some(fields::TAGGED_PAYLOAD),
                self.runtime.tagged_pointer_payload(address),
            );
        } else {
            let mut ivars = [Ivar::default(); MAX_INTROSPECTED_IVARS];
            let count = self.runtime.ivars(address, &mut ivars).min(MAX_INTROSPECTED_IVARS);
            *limit -= count as i32;
            for ivar in &ivars[..count] {
                self.write_ivar(writer, address, ivar, limit);
            }
        }
        writer.end_container();
    }

    fn write_ivar(&self, writer: &mut dyn ReportWriter, address: usize, ivar: &Ivar<'_>, limit: &mut i32) {
        let mut raw = [0u8; 8];
        let key = Some(ivar.name);
        let size = match ivar.type_code {
            b'c' | b'C' | b'B' => 1,
            b's' | b'S' => 2,
            b'i' | b'I' | b'l' | b'L' | b'f' => 4,
            b'q' | b'Q' | b'd' => 8,
            b'*' | b'@' | b'#' | b':' => std::mem::size_of::<usize>(),
            other => {
                crash_debug!("{}: Unknown ivar type [{}]", ivar.name, other as char);
                return;
            }
        };
        if !self.runtime.ivar_value(address, ivar.index, &mut raw[..size]) {
            return;
        }
        let unsigned = u64::from_ne_bytes(raw);
        match ivar.type_code {
            b'c' => writer.add_integer_element(key, i8::from_ne_bytes([raw[0]]) as i64),
            b's' => writer.add_integer_element(key, i16::from_ne_bytes([raw[0], raw[1]]) as i64),
            b'i' | b'l' => {
                writer.add_integer_element(key, i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64)
            }
            b'q' => writer.add_integer_element(key, unsigned as i64),
            b'C' => writer.add_uinteger_element(key, raw[0] as u64),
            b'S' => writer.add_uinteger_element(key, u16::from_ne_bytes([raw[0], raw[1]]) as u64),
            b'I' | b'L' => {
                writer.add_uinteger_element(key, u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64)
            }
            b'Q' => writer.add_uinteger_element(key, unsigned),
            b'f' => writer.add_floating_point_element(
                key,
                f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            ),
            b'd' => writer.add_floating_point_element(key, f64::from_ne_bytes(raw)),
            b'B' => writer.add_boolean_element(key, raw[0] != 0),
            _ => {
                let mut word = [0u8; std::mem::size_of::<usize>()];
                word.copy_from_slice(&raw[..std::mem::size_of::<usize>()]);
                self.write_memory_contents(writer, key, usize::from_ne_bytes(word), limit);
            }
        }
    }
}

/// Whether `address` points to a NUL terminated UTF-8 string of printable text, at least
/// [MIN_STRING_LENGTH] bytes long.
pub fn is_valid_string(address: usize) -> bool {
    let mut buffer = [0u8; MAX_STRING_CHECK_LENGTH];
    read_valid_string(address, &mut buffer).is_some()
}

fn read_valid_string(address: usize, buffer: &mut [u8]) -> Option<&str> {
    if address == 0 || address.checked_add(buffer.len()).is_none() {
        return None;
    }
    let copied = copy_max_possible(address, buffer);
    printable_c_string(&buffer[..copied], MIN_STRING_LENGTH)
}

/// The text before the first NUL of `bytes`, if there is a NUL, the text is valid UTF-8 without
/// control characters other than whitespace, and it is at least `min_length` bytes long.
pub fn printable_c_string(bytes: &[u8], min_length: usize) -> Option<&str> {
    let end = bytes.iter().position(|b| *b == 0)?;
    if end < min_length {
        return None;
    }
    let text = std::str::from_utf8(&bytes[..end]).ok()?;
    let printable = text
        .bytes()
        .all(|b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0b | 0x0c));
    printable.then_some(text)
}

/// The first `0x`-prefixed hex number in `text`.
pub fn extract_hex_value(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    let mut search = 0;
    while let Some(offset) = bytes[search..].windows(2).position(|w| w == b"0x" || w == b"0X") {
        let start = search + offset + 2;
        let digits = bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_hexdigit())
            .count();
        if digits > 0 {
            let digits = &text[start..start + digits.min(16)];
            return u64::from_str_radix(digits, 16).ok();
        }
        search = start;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::writer::JsonReportWriter;
    use crate::shared::constants::DEFAULT_MEMORY_SEARCH_DEPTH;
    use serde_json::Value;

    const NODE: usize = 0x1000;
    const LEAF: usize = 0x2000;
    const SECRET: usize = 0x3000;

    /// A runtime with a node object whose `next` ivar points back at itself, a leaf object with
    /// scalar ivars, and an object of an excluded class.
    struct FakeRuntime;

    impl ObjectIntrospector for FakeRuntime {
        fn object_kind(&self, address: usize) -> ObjectKind {
            match address {
                NODE | LEAF | SECRET => ObjectKind::Object,
                _ => ObjectKind::Unknown,
            }
        }

        fn class_name(&self, address: usize) -> Option<&str> {
            match address {
                NODE => Some("Node"),
                LEAF => Some("Leaf"),
                SECRET => Some("Secret"),
                _ => None,
            }
        }

        fn ivars<'s>(&'s self, address: usize, ivars: &mut [Ivar<'s>]) -> usize {
            let list: &[Ivar<'s>] = match address {
                NODE => &[
                    Ivar { name: "next", type_code: b'@', index: 0 },
                    Ivar { name: "leaf", type_code: b'@', index: 1 },
                ],
                LEAF => &[
                    Ivar { name: "count", type_code: b'i', index: 0 },
                    Ivar { name: "ratio", type_code: b'd', index: 1 },
                    Ivar { name: "flag", type_code: b'B', index: 2 },
                    Ivar { name: "odd", type_code: b'{', index: 3 },
                ],
                SECRET => &[Ivar { name: "password", type_code: b'*', index: 0 }],
                _ => &[],
            };
            let count = list.len().min(ivars.len());
            ivars[..count].copy_from_slice(&list[..count]);
            count
        }

        fn ivar_value(&self, address: usize, index: usize, value: &mut [u8]) -> bool {
            match (address, index) {
                (NODE, 0) => value.copy_from_slice(&NODE.to_ne_bytes()),
                (NODE, 1) => value.copy_from_slice(&LEAF.to_ne_bytes()),
                (LEAF, 0) => value.copy_from_slice(&(-5i32).to_ne_bytes()),
                (LEAF, 1) => value.copy_from_slice(&2.5f64.to_ne_bytes()),
                (LEAF, 2) => value[0] = 1,
                _ => return false,
            }
            true
        }
    }

    fn dump(address: usize, rules: &IntrospectionRules, limit: i32) -> Value {
        let introspection = MemoryIntrospection {
            runtime: &FakeRuntime,
            rules,
        };
        let mut writer = JsonReportWriter::new(Vec::new());
        let mut budget = limit;
        introspection.write_memory_contents(&mut writer, None, address, &mut budget);
        serde_json::from_slice(&writer.finish()).unwrap()
    }

    fn depth(value: &Value) -> usize {
        match value {
            Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
            Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Memory records nested along the `next` ivar chain.
    fn chain_length(doc: &Value) -> usize {
        let mut length = 0;
        let mut record = Some(doc);
        while let Some(current) = record.filter(|r| r.get("address").is_some()) {
            length += 1;
            record = current.get("ivars").and_then(|ivars| ivars.get("next"));
        }
        length
    }

    #[test]
    fn test_cyclic_graph_stops_at_budget() {
        let doc = dump(NODE, &IntrospectionRules::new(), DEFAULT_MEMORY_SEARCH_DEPTH);
        assert_eq!(doc["class"], "Node");
        assert_eq!(doc["ivars"]["next"]["class"], "Node");
        assert!(depth(&doc) <= DEFAULT_MEMORY_SEARCH_DEPTH as usize, "{doc}");
        // Every level spends one for its record, one for its ivars and one per ivar.
        assert_eq!(chain_length(&doc), 5, "{doc}");

        assert_eq!(chain_length(&dump(NODE, &IntrospectionRules::new(), 1)), 1);
        assert_eq!(chain_length(&dump(NODE, &IntrospectionRules::new(), 4)), 2);
    }

    /// A runtime with one string object whose contents end in invalid UTF-8.
    struct TextRuntime;

    impl ObjectIntrospector for TextRuntime {
        fn object_kind(&self, address: usize) -> ObjectKind {
            if address == NODE {
                ObjectKind::Object
            } else {
                ObjectKind::Unknown
            }
        }

        fn class_name(&self, _address: usize) -> Option<&str> {
            Some("Text")
        }

        fn class_kind(&self, _address: usize) -> ClassKind {
            ClassKind::String
        }

        fn string_contents(&self, _address: usize, buffer: &mut [u8]) -> Option<usize> {
            let contents = b"caf\xc3\xa9 \xff tail";
            buffer[..contents.len()].copy_from_slice(contents);
            Some(contents.len())
        }
    }

    #[test]
    fn test_string_object_keeps_its_valid_prefix() {
        let introspection = MemoryIntrospection {
            runtime: &TextRuntime,
            rules: &IntrospectionRules::new(),
        };
        let mut writer = JsonReportWriter::new(Vec::new());
        let mut budget = DEFAULT_MEMORY_SEARCH_DEPTH;
        introspection.write_memory_contents(&mut writer, None, NODE, &mut budget);
        let doc: Value = serde_json::from_slice(&writer.finish()).unwrap();
        assert_eq!(doc["class"], "Text");
        assert_eq!(doc["value"], "caf\u{e9} ");
    }

    #[test]
    fn test_scalar_ivars() {
        let doc = dump(LEAF, &IntrospectionRules::new(), 15);
        assert_eq!(doc["type"], "objc_object");
        assert_eq!(doc["ivars"]["count"], -5);
        assert_eq!(doc["ivars"]["ratio"], 2.5);
        assert_eq!(doc["ivars"]["flag"], true);
        assert!(doc["ivars"].get("odd").is_none());
    }

    #[test]
    fn test_excluded_class_is_written_by_name_only() {
        let rules = IntrospectionRules {
            enabled: true,
            excluded_classes: vec!["Secret".to_string()],
        };
        let doc = dump(SECRET, &rules, 15);
        assert_eq!(doc["class"], "Secret");
        assert_eq!(doc["type"], "objc_object");
        assert!(doc.get("ivars").is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_strings_and_plain_addresses() {
        let text = b"a readable string\0";
        let doc = dump(text.as_ptr() as usize, &IntrospectionRules::new(), 15);
        assert_eq!(doc["type"], "string");
        assert_eq!(doc["value"], "a readable string");

        assert_eq!(dump(0, &IntrospectionRules::new(), 15)["type"], "null_pointer");
        assert_eq!(dump(0x10, &IntrospectionRules::new(), 15)["type"], "unknown");

        let introspection = MemoryIntrospection {
            runtime: &NoRuntime,
            rules: &IntrospectionRules::new(),
        };
        assert!(introspection.is_notable(text.as_ptr() as usize));
        let short = b"ab\0";
        assert!(!introspection.is_notable(short.as_ptr() as usize));
        assert!(!introspection.is_notable(0));
    }

    #[test]
    fn test_printable_c_string() {
        assert_eq!(printable_c_string(b"hello\0junk", 4), Some("hello"));
        assert_eq!(printable_c_string(b"tab\there\0", 4), Some("tab\there"));
        assert_eq!(printable_c_string(b"no terminator", 4), None);
        assert_eq!(printable_c_string(b"bell\x07\0", 4), None);
        assert_eq!(printable_c_string(b"\xff\xfe\xfd\xfc\0", 4), None);
    }

    #[test]
    fn test_extract_hex_value() {
        assert_eq!(
            extract_hex_value("*** -[Foo bar]: unrecognized selector sent to instance 0x7fa4c1d0"),
            Some(0x7fa4c1d0)
        );
        assert_eq!(extract_hex_value("0x then 0XAB"), Some(0xab));
        assert_eq!(extract_hex_value("no address"), None);
    }
}
