// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoding into a byte sink, without allocating.
//!
//! [JsonEncoder] keeps a stack of open containers and writes each element as soon as it is
//! added. [JsonRepairer] lexes JSON text chunk by chunk, forwarding it to a sink, and can close
//! whatever was left open when the text ends early; it backs both the validation of JSON
//! fragments and the embedding of a truncated report into a recrash report.

use super::buffered_writer::{BufferedReader, BufferedWriter};
use crate::shared::constants::JSON_MAX_CONTAINER_DEPTH;
use crate::shared::fmt_buf::FmtBuf;
use std::ffi::CStr;
use std::fmt::Write as _;

const HEX_NYBBLES: &[u8; 16] = b"0123456789ABCDEF";
const INDENT: &[u8] = b"    ";
const FILE_CHUNK_SIZE: usize = 1024;
const MAX_TOKEN_LENGTH: usize = 64;
const REPLACEMENT_CHARACTER: &[u8] = b"\\ufffd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JsonError {
    #[error("Cannot add data")]
    CannotAddData,
    #[error("Invalid character")]
    InvalidCharacter,
    #[error("Data too long")]
    DataTooLong,
    #[error("Incomplete data")]
    Incomplete,
    #[error("Invalid data")]
    InvalidData,
    #[error("Missing key in object")]
    MissingKey,
}

pub type JsonResult = Result<(), JsonError>;

/// Destination of encoded bytes.
pub trait JsonSink {
    /// Returns false if the bytes could not be written.
    fn write_json(&mut self, bytes: &[u8]) -> bool;

    fn flush_json(&mut self) -> bool {
        true
    }
}

impl JsonSink for BufferedWriter {
    fn write_json(&mut self, bytes: &[u8]) -> bool {
        self.write(bytes)
    }

    fn flush_json(&mut self) -> bool {
        self.flush()
    }
}

impl JsonSink for Vec<u8> {
    fn write_json(&mut self, bytes: &[u8]) -> bool {
        self.extend_from_slice(bytes);
        true
    }
}

/// Discards everything. Used to validate without writing.
pub struct NullSink;

impl JsonSink for NullSink {
    fn write_json(&mut self, _bytes: &[u8]) -> bool {
        true
    }
}

fn emit<S: JsonSink + ?Sized>(sink: &mut S, bytes: &[u8]) -> JsonResult {
    if bytes.is_empty() || sink.write_json(bytes) {
        Ok(())
    } else {
        Err(JsonError::CannotAddData)
    }
}

/// Writes `text` as the inside of a JSON string.
fn emit_escaped<S: JsonSink + ?Sized>(sink: &mut S, text: &str) -> JsonResult {
    let bytes = text.as_bytes();
    let mut run_start = 0;
    for (index, byte) in bytes.iter().enumerate() {
        let escaped: &[u8] = match byte {
            b'"' => b"\\\"",
            b'\\' => b"\\\\",
            b'\n' => b"\\n",
            b'\r' => b"\\r",
            b'\t' => b"\\t",
            0x08 => b"\\b",
            0x0c => b"\\f",
            0x00..=0x1f => b"",
            _ => continue,
        };
        emit(sink, &bytes[run_start..index])?;
        if escaped.is_empty() {
            let control = [
                b'\\',
                b'u',
                b'0',
                b'0',
                HEX_NYBBLES[(byte >> 4) as usize],
                HEX_NYBBLES[(byte & 15) as usize],
            ];
            emit(sink, &control)?;
        } else {
            emit(sink, escaped)?;
        }
        run_start = index + 1;
    }
    emit(sink, &bytes[run_start..])
}

/// Writes `bytes` as the inside of a JSON string, replacing invalid UTF-8.
/// Returns how many trailing bytes form an incomplete sequence and were not written, which is
/// only possible when `allow_incomplete` is set.
fn emit_escaped_bytes<S: JsonSink + ?Sized>(
    sink: &mut S,
    mut bytes: &[u8],
    allow_incomplete: bool,
) -> Result<usize, JsonError> {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                emit_escaped(sink, text)?;
                return Ok(0);
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                // SAFETY: `valid_up_to` delimits a valid UTF-8 prefix.
                emit_escaped(sink, unsafe { std::str::from_utf8_unchecked(valid) })?;
                match e.error_len() {
                    Some(len) => {
                        emit(sink, REPLACEMENT_CHARACTER)?;
                        bytes = &rest[len..];
                    }
                    None if allow_incomplete => return Ok(rest.len()),
                    None => {
                        emit(sink, REPLACEMENT_CHARACTER)?;
                        return Ok(0);
                    }
                }
            }
        }
    }
}

/// Streaming JSON encoder.
///
/// Containers must be closed in the reverse order they were opened; [JsonEncoder::end_encode]
/// closes whatever is still open. Keys are required inside objects and ignored elsewhere.
pub struct JsonEncoder<W: JsonSink> {
    sink: W,
    pretty_print: bool,
    is_object: [bool; JSON_MAX_CONTAINER_DEPTH],
    depth: usize,
    first_entry: bool,
    // Start of a UTF-8 sequence split across appended string chunks.
    carry: [u8; 4],
    carry_len: usize,
}

impl<W: JsonSink> JsonEncoder<W> {
    pub fn new(sink: W, pretty_print: bool) -> Self {
        Self {
            sink,
            pretty_print,
            is_object: [false; JSON_MAX_CONTAINER_DEPTH],
            depth: 0,
            first_entry: true,
            carry: [0; 4],
            carry_len: 0,
        }
    }

    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Number of open containers.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn flush(&mut self) -> bool {
        self.sink.flush_json()
    }

    fn add(&mut self, bytes: &[u8]) -> JsonResult {
        emit(&mut self.sink, bytes)
    }

    fn indent(&mut self) -> JsonResult {
        if self.pretty_print {
            self.add(b"\n")?;
            for _ in 0..self.depth {
                self.add(INDENT)?;
            }
        }
        Ok(())
    }

    fn begin_element(&mut self, key: Option<&str>) -> JsonResult {
        if self.depth == 0 {
            return Ok(());
        }
        let in_object = self.is_object[self.depth - 1];
        if in_object && key.is_none() {
            return Err(JsonError::MissingKey);
        }
        if !self.first_entry {
            self.add(b",")?;
        }
        self.first_entry = false;
        self.indent()?;
        if let (true, Some(key)) = (in_object, key) {
            self.add(b"\"")?;
            emit_escaped(&mut self.sink, key)?;
            let separator: &[u8] = if self.pretty_print { b"\": " } else { b"\":" };
            self.add(separator)?;
        }
        Ok(())
    }

    fn push_container(&mut self, is_object: bool, first_entry: bool) -> JsonResult {
        if self.depth >= JSON_MAX_CONTAINER_DEPTH {
            return Err(JsonError::DataTooLong);
        }
        self.is_object[self.depth] = is_object;
        self.depth += 1;
        self.first_entry = first_entry;
        Ok(())
    }

    fn begin_container(&mut self, key: Option<&str>, is_object: bool) -> JsonResult {
        if self.depth >= JSON_MAX_CONTAINER_DEPTH {
            return Err(JsonError::DataTooLong);
        }
        self.begin_element(key)?;
        self.add(if is_object { b"{" } else { b"[" })?;
        self.push_container(is_object, true)
    }

    pub fn begin_object(&mut self, key: Option<&str>) -> JsonResult {
        self.begin_container(key, true)
    }

    pub fn begin_array(&mut self, key: Option<&str>) -> JsonResult {
        self.begin_container(key, false)
    }

    /// Closes the innermost open container. Does nothing when none is open.
    pub fn end_container(&mut self) -> JsonResult {
        if self.depth == 0 {
            return Ok(());
        }
        self.depth -= 1;
        if !self.first_entry {
            self.indent()?;
        }
        self.first_entry = false;
        let closer: &[u8] = if self.is_object[self.depth] { b"}" } else { b"]" };
        self.add(closer)
    }

    /// Closes every open container.
    pub fn end_encode(&mut self) -> JsonResult {
        while self.depth > 0 {
            self.end_container()?;
        }
        if self.pretty_print {
            self.add(b"\n")?;
        }
        Ok(())
    }

    pub fn add_null_element(&mut self, key: Option<&str>) -> JsonResult {
        self.begin_element(key)?;
        self.add(b"null")
    }

    pub fn add_boolean_element(&mut self, key: Option<&str>, value: bool) -> JsonResult {
        self.begin_element(key)?;
        let literal: &[u8] = if value { b"true" } else { b"false" };
        self.add(literal)
    }

    pub fn add_integer_element(&mut self, key: Option<&str>, value: i64) -> JsonResult {
        let mut buf = FmtBuf::<24>::new();
        let _ = write!(buf, "{value}");
        self.begin_element(key)?;
        self.add(buf.as_bytes())
    }

    pub fn add_uinteger_element(&mut self, key: Option<&str>, value: u64) -> JsonResult {
        let mut buf = FmtBuf::<24>::new();
        let _ = write!(buf, "{value}");
        self.begin_element(key)?;
        self.add(buf.as_bytes())
    }

    /// Non-finite values have no JSON representation and are written as `null`.
    pub fn add_floating_point_element(&mut self, key: Option<&str>, value: f64) -> JsonResult {
        if !value.is_finite() {
            return self.add_null_element(key);
        }
        let mut buf = FmtBuf::<64>::new();
        let magnitude = value.abs();
        if magnitude == 0.0 || (1e-5..1e15).contains(&magnitude) {
            let _ = write!(buf, "{value}");
        } else {
            let _ = write!(buf, "{value:e}");
        }
        self.begin_element(key)?;
        self.add(buf.as_bytes())
    }

    pub fn add_string_element(&mut self, key: Option<&str>, value: &str) -> JsonResult {
        self.begin_element(key)?;
        self.add(b"\"")?;
        emit_escaped(&mut self.sink, value)?;
        self.add(b"\"")
    }

    /// Adds text that is expected, but not known, to be UTF-8. Invalid sequences are replaced.
    pub fn add_bytes_string_element(&mut self, key: Option<&str>, value: &[u8]) -> JsonResult {
        self.begin_element(key)?;
        self.add(b"\"")?;
        emit_escaped_bytes(&mut self.sink, value, false)?;
        self.add(b"\"")
    }

    /// Starts a string whose contents are added with [JsonEncoder::append_string_element].
    pub fn begin_string_element(&mut self, key: Option<&str>) -> JsonResult {
        self.begin_element(key)?;
        self.carry_len = 0;
        self.add(b"\"")
    }

    /// Appends to the string started by [JsonEncoder::begin_string_element]. A UTF-8 sequence
    /// may be split between calls.
    pub fn append_string_element(&mut self, mut bytes: &[u8]) -> JsonResult {
        if self.carry_len > 0 {
            let mut joined = [0u8; 4];
            let carried = self.carry_len;
            joined[..carried].copy_from_slice(&self.carry[..carried]);
            let take = bytes.len().min(4 - carried);
            joined[carried..carried + take].copy_from_slice(&bytes[..take]);
            self.carry_len = 0;
            let pending = emit_escaped_bytes(&mut self.sink, &joined[..carried + take], true)?;
            let consumed = (carried + take - pending).saturating_sub(carried);
            if pending > 0 && consumed == 0 && take == bytes.len() {
                // Still incomplete, and nothing else to join with yet.
                self.carry[..pending].copy_from_slice(&joined[carried + take - pending..carried + take]);
                self.carry_len = pending;
                return Ok(());
            }
            if pending > 0 && consumed == 0 {
                // The joined bytes can never form a valid sequence.
                emit(&mut self.sink, REPLACEMENT_CHARACTER)?;
                bytes = &bytes[take..];
            } else {
                bytes = &bytes[consumed..];
            }
        }
        let pending = emit_escaped_bytes(&mut self.sink, bytes, true)?;
        self.carry[..pending].copy_from_slice(&bytes[bytes.len() - pending..]);
        self.carry_len = pending;
        Ok(())
    }

    pub fn end_string_element(&mut self) -> JsonResult {
        if self.carry_len > 0 {
            self.carry_len = 0;
            self.add(REPLACEMENT_CHARACTER)?;
        }
        self.add(b"\"")
    }

    /// Adds binary data as a string of uppercase hex digits.
    pub fn add_data_element(&mut self, key: Option<&str>, data: &[u8]) -> JsonResult {
        self.begin_data_element(key)?;
        self.append_data_element(data)?;
        self.end_data_element()
    }

    pub fn begin_data_element(&mut self, key: Option<&str>) -> JsonResult {
        self.begin_string_element(key)
    }

    pub fn append_data_element(&mut self, data: &[u8]) -> JsonResult {
        let mut hex = [0u8; 128];
        for chunk in data.chunks(hex.len() / 2) {
            for (index, byte) in chunk.iter().enumerate() {
                hex[index * 2] = HEX_NYBBLES[(byte >> 4) as usize];
                hex[index * 2 + 1] = HEX_NYBBLES[(byte & 15) as usize];
            }
            self.add(&hex[..chunk.len() * 2])?;
        }
        Ok(())
    }

    pub fn end_data_element(&mut self) -> JsonResult {
        self.add(b"\"")
    }

    /// Adds a JSON fragment verbatim after checking it is a single well-formed value.
    ///
    /// If `close_last_container` is false and the fragment is an object or array, it is left
    /// open: later elements are added inside it and [JsonEncoder::end_container] closes it.
    pub fn add_json_element(
        &mut self,
        key: Option<&str>,
        json: &[u8],
        close_last_container: bool,
    ) -> JsonResult {
        validate(json)?;
        let fragment = json.trim_ascii();
        let (leave_open, is_object) = match fragment.last() {
            Some(b'}') => (!close_last_container, true),
            Some(b']') => (!close_last_container, false),
            _ => (false, false),
        };
        if leave_open && self.depth >= JSON_MAX_CONTAINER_DEPTH {
            return Err(JsonError::DataTooLong);
        }
        self.begin_element(key)?;
        if !leave_open {
            return self.add(fragment);
        }
        let body = &fragment[..fragment.len() - 1];
        self.add(body)?;
        let is_empty = body[1..].trim_ascii().is_empty();
        self.push_container(is_object, is_empty)
    }

    /// Adds the JSON document stored at `path`. A truncated document is completed so that the
    /// output stays well-formed; the error then tells what was wrong with it.
    ///
    /// `close_last_container` works as for [JsonEncoder::add_json_element].
    pub fn add_json_from_file(
        &mut self,
        key: Option<&str>,
        path: &CStr,
        close_last_container: bool,
    ) -> JsonResult {
        let mut reader = match BufferedReader::<FILE_CHUNK_SIZE>::open(path) {
            Ok(reader) => reader,
            Err(errno) => {
                crash_error!("Could not open {:?}: errno {}", path, errno);
                return Err(JsonError::CannotAddData);
            }
        };
        if !close_last_container && self.depth >= JSON_MAX_CONTAINER_DEPTH {
            return Err(JsonError::DataTooLong);
        }
        self.begin_element(key)?;
        let mut lexer = if close_last_container {
            JsonRepairer::new()
        } else {
            JsonRepairer::keeping_outermost_open()
        };
        let mut feed_result = Ok(());
        loop {
            let chunk = reader.read_chunk();
            if chunk.is_empty() {
                break;
            }
            feed_result = lexer.feed(chunk, &mut self.sink);
            if feed_result.is_err() {
                break;
            }
        }
        let finish_result = lexer.finish(&mut self.sink);
        if let Some((is_object, has_entries)) = lexer.open_outermost() {
            self.push_container(is_object, !has_entries)?;
        }
        feed_result.and(finish_result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    FirstValueOrEnd,
    FirstKeyOrEnd,
    Key,
    Colon,
    CommaOrEnd,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Structural,
    String { is_key: bool },
    Token,
}

/// Incremental JSON lexer that forwards a compact copy of its input and can complete it.
///
/// Whitespace outside strings is dropped. Commas are held back until the next element starts,
/// and escapes and multi-byte characters until they are whole, so that cutting the input at any
/// byte leaves the forwarded text completable.
pub struct JsonRepairer {
    containers: [u8; JSON_MAX_CONTAINER_DEPTH],
    depth: usize,
    expect: Expect,
    lexeme: Lexeme,
    pending_comma: bool,
    held: [u8; 6],
    held_len: usize,
    held_needed: usize,
    held_is_escape: bool,
    token: [u8; MAX_TOKEN_LENGTH],
    token_len: usize,
    outer_has_entries: bool,
    keep_outermost: bool,
    outermost_held: bool,
    failed: Option<JsonError>,
}

impl JsonRepairer {
    pub fn new() -> Self {
        Self {
            containers: [0; JSON_MAX_CONTAINER_DEPTH],
            depth: 0,
            expect: Expect::Value,
            lexeme: Lexeme::Structural,
            pending_comma: false,
            held: [0; 6],
            held_len: 0,
            held_needed: 0,
            held_is_escape: false,
            token: [0; MAX_TOKEN_LENGTH],
            token_len: 0,
            outer_has_entries: false,
            keep_outermost: false,
            outermost_held: false,
            failed: None,
        }
    }

    /// A lexer that never forwards the closer of the outermost container.
    pub fn keeping_outermost_open() -> Self {
        Self {
            keep_outermost: true,
            ..Self::new()
        }
    }

    /// Marks the end of the input: a number or literal still being lexed is complete now.
    /// Does not repair anything, see [JsonRepairer::finish].
    pub fn end_input<S: JsonSink + ?Sized>(&mut self, sink: &mut S) -> JsonResult {
        if self.failed.is_some() || self.lexeme != Lexeme::Token {
            return Ok(());
        }
        self.end_token(sink).inspect_err(|&e| self.failed = Some(e))
    }

    /// Whether the input so far is exactly one complete JSON value.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.lexeme == Lexeme::Structural && self.expect == Expect::Finished
    }

    /// The outermost container, if it was left open: whether it is an object, and whether it
    /// has entries.
    pub fn open_outermost(&self) -> Option<(bool, bool)> {
        let left_open = self.keep_outermost && (self.depth == 1 || self.outermost_held);
        left_open.then(|| (self.containers[0] == b'{', self.outer_has_entries))
    }

    /// Lexes `input`, forwarding it to `sink`. After an error, the lexer stops consuming input
    /// but can still be finished.
    pub fn feed<S: JsonSink + ?Sized>(&mut self, input: &[u8], sink: &mut S) -> JsonResult {
        if let Some(e) = self.failed {
            return Err(e);
        }
        let mut index = 0;
        while index < input.len() {
            let step = match self.lexeme {
                Lexeme::String { is_key } => self.feed_string(&input[index..], is_key, sink),
                Lexeme::Token => self.feed_token(&input[index..], sink),
                Lexeme::Structural => self.feed_structural(input[index], sink).map(|_| 1),
            };
            match step {
                Ok(consumed) => index += consumed,
                Err(e) => {
                    self.failed = Some(e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn value_complete(&mut self) {
        self.expect = if self.depth == 0 {
            Expect::Finished
        } else {
            Expect::CommaOrEnd
        };
    }

    fn start_entry<S: JsonSink + ?Sized>(&mut self, sink: &mut S) -> JsonResult {
        if self.pending_comma {
            self.pending_comma = false;
            emit(sink, b",")?;
        }
        if self.depth == 1 {
            self.outer_has_entries = true;
        }
        Ok(())
    }

    fn start_value<S: JsonSink + ?Sized>(&mut self, sink: &mut S) -> JsonResult {
        match self.expect {
            Expect::Value | Expect::FirstValueOrEnd => self.start_entry(sink),
            _ => Err(JsonError::InvalidData),
        }
    }

    fn feed_structural<S: JsonSink + ?Sized>(&mut self, byte: u8, sink: &mut S) -> JsonResult {
        match byte {
            b' ' | b'\t' | b'\n' | b'\r' => Ok(()),
            b'{' | b'[' => {
                if self.depth >= JSON_MAX_CONTAINER_DEPTH {
                    return Err(JsonError::DataTooLong);
                }
                self.start_value(sink)?;
                emit(sink, &[byte])?;
                self.containers[self.depth] = byte;
                self.depth += 1;
                self.expect = if byte == b'{' {
                    Expect::FirstKeyOrEnd
                } else {
                    Expect::FirstValueOrEnd
                };
                Ok(())
            }
            b'}' | b']' => {
                let opener = if byte == b'}' { b'{' } else { b'[' };
                let may_close = match self.expect {
                    Expect::CommaOrEnd => !self.pending_comma,
                    Expect::FirstKeyOrEnd => byte == b'}',
                    Expect::FirstValueOrEnd => byte == b']',
                    _ => false,
                };
                if !may_close || self.depth == 0 || self.containers[self.depth - 1] != opener {
                    return Err(JsonError::InvalidData);
                }
                if self.keep_outermost && self.depth == 1 {
                    self.outermost_held = true;
                } else {
                    emit(sink, &[byte])?;
                }
                self.depth -= 1;
                self.value_complete();
                Ok(())
            }
            b',' => {
                if self.expect != Expect::CommaOrEnd {
                    return Err(JsonError::InvalidData);
                }
                self.pending_comma = true;
                self.expect = if self.containers[self.depth - 1] == b'{' {
                    Expect::Key
                } else {
                    Expect::Value
                };
                Ok(())
            }
            b':' => {
                if self.expect != Expect::Colon {
                    return Err(JsonError::InvalidData);
                }
                emit(sink, b":")?;
                self.expect = Expect::Value;
                Ok(())
            }
            b'"' => {
                let is_key = match self.expect {
                    Expect::FirstKeyOrEnd | Expect::Key => {
                        self.start_entry(sink)?;
                        true
                    }
                    _ => {
                        self.start_value(sink)?;
                        false
                    }
                };
                emit(sink, b"\"")?;
                self.lexeme = Lexeme::String { is_key };
                Ok(())
            }
            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => {
                if !matches!(self.expect, Expect::Value | Expect::FirstValueOrEnd) {
                    return Err(JsonError::InvalidData);
                }
                self.token[0] = byte;
                self.token_len = 1;
                self.lexeme = Lexeme::Token;
                Ok(())
            }
            _ => Err(JsonError::InvalidCharacter),
        }
    }

    fn feed_string<S: JsonSink + ?Sized>(
        &mut self,
        input: &[u8],
        is_key: bool,
        sink: &mut S,
    ) -> Result<usize, JsonError> {
        let mut run_start = 0;
        let mut index = 0;
        while index < input.len() {
            let byte = input[index];
            if self.held_len > 0 {
                self.hold(byte)?;
                index += 1;
                run_start = index;
                if self.held_len == self.held_needed {
                    emit(sink, &self.held[..self.held_len])?;
                    self.held_len = 0;
                }
                continue;
            }
            match byte {
                b'"' => {
                    emit(sink, &input[run_start..index])?;
                    emit(sink, b"\"")?;
                    self.lexeme = Lexeme::Structural;
                    if is_key {
                        self.expect = Expect::Colon;
                    } else {
                        self.value_complete();
                    }
                    return Ok(index + 1);
                }
                b'\\' | 0x80..=0xff => {
                    emit(sink, &input[run_start..index])?;
                    let (needed, is_escape) = if byte == b'\\' {
                        (2, true)
                    } else {
                        (utf8_sequence_length(byte).ok_or(JsonError::InvalidCharacter)?, false)
                    };
                    self.held[0] = byte;
                    self.held_len = 1;
                    self.held_needed = needed;
                    self.held_is_escape = is_escape;
                    index += 1;
                    run_start = index;
                }
                0x00..=0x1f => return Err(JsonError::InvalidCharacter),
                _ => index += 1,
            }
        }
        emit(sink, &input[run_start..])?;
        Ok(input.len())
    }

    fn hold(&mut self, byte: u8) -> JsonResult {
        if self.held_is_escape {
            if self.held_len == 1 {
                match byte {
                    b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => {}
                    b'u' => self.held_needed = 6,
                    _ => return Err(JsonError::InvalidCharacter),
                }
            } else if !byte.is_ascii_hexdigit() {
                return Err(JsonError::InvalidCharacter);
            }
        } else if byte & 0xc0 != 0x80 {
            return Err(JsonError::InvalidCharacter);
        }
        self.held[self.held_len] = byte;
        self.held_len += 1;
        Ok(())
    }

    fn feed_token<S: JsonSink + ?Sized>(&mut self, input: &[u8], sink: &mut S) -> Result<usize, JsonError> {
        for (index, byte) in input.iter().enumerate() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'-' | b'.') {
                if self.token_len == MAX_TOKEN_LENGTH {
                    return Err(JsonError::DataTooLong);
                }
                self.token[self.token_len] = *byte;
                self.token_len += 1;
                continue;
            }
            self.end_token(sink)?;
            return Ok(index);
        }
        Ok(input.len())
    }

    fn end_token<S: JsonSink + ?Sized>(&mut self, sink: &mut S) -> JsonResult {
        let token = &self.token[..self.token_len];
        if !is_valid_scalar(token) {
            return Err(JsonError::InvalidData);
        }
        self.start_value(sink)?;
        emit(sink, &self.token[..self.token_len])?;
        self.lexeme = Lexeme::Structural;
        self.value_complete();
        Ok(())
    }

    /// Completes the forwarded text into well-formed JSON.
    ///
    /// Returns `Ok` if the input was already complete, otherwise the reason it was not.
    pub fn finish<S: JsonSink + ?Sized>(&mut self, sink: &mut S) -> JsonResult {
        if self.failed.is_none() && self.lexeme == Lexeme::Token && self.end_token(sink).is_err() {
            // A literal cut short, completed below as `null`.
            self.lexeme = Lexeme::Structural;
        }
        let result = match self.failed {
            Some(e) => Err(e),
            None if self.is_complete() => Ok(()),
            None => Err(JsonError::Incomplete),
        };

        match self.lexeme {
            Lexeme::String { is_key } => {
                self.held_len = 0;
                emit(sink, b"\"")?;
                if is_key {
                    emit(sink, b":null")?;
                    self.expect = Expect::CommaOrEnd;
                } else {
                    self.value_complete();
                }
            }
            Lexeme::Token => {
                if self.end_token(sink).is_err() {
                    self.lexeme = Lexeme::Structural;
                }
            }
            Lexeme::Structural => {}
        }
        self.lexeme = Lexeme::Structural;

        match self.expect {
            Expect::Colon => {
                emit(sink, b":null")?;
                self.expect = Expect::CommaOrEnd;
            }
            Expect::Value if !self.pending_comma => {
                self.start_entry(sink)?;
                emit(sink, b"null")?;
                self.value_complete();
            }
            _ => {}
        }
        self.pending_comma = false;

        let keep = usize::from(self.keep_outermost);
        while self.depth > keep {
            self.depth -= 1;
            emit(sink, if self.containers[self.depth] == b'{' { b"}" } else { b"]" })?;
        }
        if self.depth == 0 {
            self.expect = Expect::Finished;
        }
        result
    }
}

impl Default for JsonRepairer {
    fn default() -> Self {
        Self::new()
    }
}

fn utf8_sequence_length(lead: u8) -> Option<usize> {
    match lead {
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

fn is_valid_scalar(token: &[u8]) -> bool {
    matches!(token, b"true" | b"false" | b"null") || is_valid_number(token)
}

/// `-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?`
fn is_valid_number(token: &[u8]) -> bool {
    fn digits(token: &[u8], mut at: usize) -> usize {
        while token.get(at).is_some_and(u8::is_ascii_digit) {
            at += 1;
        }
        at
    }
    let mut at = usize::from(token.first() == Some(&b'-'));
    match token.get(at) {
        Some(b'0') => at += 1,
        Some(b'1'..=b'9') => at = digits(token, at),
        _ => return false,
    }
    if token.get(at) == Some(&b'.') {
        let end = digits(token, at + 1);
        if end == at + 1 {
            return false;
        }
        at = end;
    }
    if matches!(token.get(at), Some(b'e' | b'E')) {
        at += 1;
        if matches!(token.get(at), Some(b'+' | b'-')) {
            at += 1;
        }
        let end = digits(token, at);
        if end == at {
            return false;
        }
        at = end;
    }
    at == token.len()
}

/// Checks that `json` is one complete JSON value, without allocating.
pub fn validate(json: &[u8]) -> JsonResult {
    let mut lexer = JsonRepairer::new();
    lexer.feed(json, &mut NullSink)?;
    lexer.end_input(&mut NullSink)?;
    if lexer.is_complete() {
        Ok(())
    } else {
        Err(JsonError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn encoder() -> JsonEncoder<Vec<u8>> {
        JsonEncoder::new(Vec::new(), false)
    }

    fn output(encoder: JsonEncoder<Vec<u8>>) -> String {
        String::from_utf8(encoder.into_sink()).unwrap()
    }

    fn repaired(input: &[u8]) -> (String, JsonResult) {
        let mut out = Vec::new();
        let mut lexer = JsonRepairer::new();
        let fed = lexer.feed(input, &mut out);
        let finished = lexer.finish(&mut out);
        (String::from_utf8(out).unwrap(), fed.and(finished))
    }

    #[test]
    fn test_encodes_nested_containers() {
        let mut e = encoder();
        e.begin_object(Some("ignored at top level")).unwrap();
        e.add_string_element(Some("name"), "a \"quoted\"\nline\u{1}").unwrap();
        e.begin_array(Some("list")).unwrap();
        e.add_integer_element(None, -3).unwrap();
        e.add_uinteger_element(Some("keys are ignored in arrays"), u64::MAX).unwrap();
        e.add_boolean_element(None, true).unwrap();
        e.add_null_element(None).unwrap();
        e.add_floating_point_element(None, 1.5).unwrap();
        e.end_container().unwrap();
        e.begin_object(Some("empty")).unwrap();
        e.end_encode().unwrap();

        let out = output(e);
        assert_eq!(
            out,
            r#"{"name":"a \"quoted\"\nline\u0001","list":[-3,18446744073709551615,true,null,1.5],"empty":{}}"#
        );
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["name"], "a \"quoted\"\nline\u{1}");
    }

    #[test]
    fn test_pretty_print_parses() {
        let mut e = JsonEncoder::new(Vec::new(), true);
        e.begin_object(None).unwrap();
        e.begin_object(Some("report")).unwrap();
        e.add_string_element(Some("id"), "X").unwrap();
        e.end_container().unwrap();
        e.add_floating_point_element(Some("big"), 1e300).unwrap();
        e.add_floating_point_element(Some("nan"), f64::NAN).unwrap();
        e.end_encode().unwrap();
        let parsed: Value = serde_json::from_slice(&e.into_sink()).unwrap();
        assert_eq!(parsed, json!({"report": {"id": "X"}, "big": 1e300, "nan": null}));
    }

    #[test]
    fn test_missing_key_and_depth_limit() {
        let mut e = encoder();
        e.begin_object(None).unwrap();
        assert_eq!(e.add_integer_element(None, 1), Err(JsonError::MissingKey));

        let mut e = encoder();
        for _ in 0..JSON_MAX_CONTAINER_DEPTH {
            e.begin_array(None).unwrap();
        }
        assert_eq!(e.begin_array(None), Err(JsonError::DataTooLong));
    }

    #[test]
    fn test_data_and_streamed_strings() {
        let mut e = encoder();
        e.begin_array(None).unwrap();
        e.add_data_element(None, &[0x00, 0xab, 0x7f]).unwrap();
        e.begin_string_element(None).unwrap();
        let text = "héllo €".as_bytes();
        // Split inside the two and three byte sequences.
        e.append_string_element(&text[..2]).unwrap();
        e.append_string_element(&text[2..7]).unwrap();
        e.append_string_element(&text[7..]).unwrap();
        e.end_string_element().unwrap();
        e.add_bytes_string_element(None, b"bad\xffbyte").unwrap();
        e.end_encode().unwrap();
        let parsed: Value = serde_json::from_str(&output(e)).unwrap();
        assert_eq!(parsed, json!(["00AB7F", "héllo €", "bad\u{fffd}byte"]));
    }

    #[test]
    fn test_json_element_validation() {
        let mut e = encoder();
        e.begin_object(None).unwrap();
        e.add_json_element(Some("ok"), br#" {"a": [1, 2.5e3, "x"]} "#, true).unwrap();
        let bad_fragments: [&[u8]; 7] = [b"{\"a\": ", b"[1,]", b"{\"a\" 1}", b"tru", b"1 2", b"", b"01"];
        for bad in bad_fragments {
            assert!(e.add_json_element(Some("bad"), bad, true).is_err(), "{bad:?}");
        }
        e.end_encode().unwrap();
        let parsed: Value = serde_json::from_str(&output(e)).unwrap();
        assert_eq!(parsed, json!({"ok": {"a": [1, 2500.0, "x"]}}));
    }

    #[test]
    fn test_scalar_json_fragments_pass_through() {
        let mut e = encoder();
        e.begin_array(None).unwrap();
        let fragments: [&[u8]; 8] = [
            b"3", b"-1.5", b"2e10", b"true", b"false", b"null", b" 0 ", b"\"s\"",
        ];
        for fragment in fragments {
            e.add_json_element(None, fragment, true)
                .unwrap_or_else(|err| panic!("{fragment:?}: {err}"));
        }
        e.end_encode().unwrap();
        let parsed: Value = serde_json::from_str(&output(e)).unwrap();
        assert_eq!(parsed, json!([3, -1.5, 2e10, true, false, null, 0, "s"]));

        for fragment in ["7", "false", "null"] {
            assert_eq!(validate(fragment.as_bytes()), Ok(()), "{fragment}");
        }
        assert!(validate(b"-").is_err());
        assert!(validate(b"nul").is_err());
    }

    #[test]
    fn test_json_element_left_open() {
        let cases: [(&[u8], Value); 2] = [
            (br#"{"user": 1}"#, json!({"u": {"user": 1, "extra": true}})),
            (b"{ }", json!({"u": {"extra": true}})),
        ];
        for (fragment, expected) in cases {
            let mut e = encoder();
            e.begin_object(None).unwrap();
            e.add_json_element(Some("u"), fragment, false).unwrap();
            e.add_boolean_element(Some("extra"), true).unwrap();
            e.end_container().unwrap();
            e.end_encode().unwrap();
            let parsed: Value = serde_json::from_str(&output(e)).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn test_repairs_truncated_documents() {
        let cases: [(&[u8], Value); 8] = [
            (br#"{"a": [1, 2"#, json!({"a": [1, 2]})),
            (br#"{"a": "unfinished str"#, json!({"a": "unfinished str"})),
            (br#"{"a": 1, "b"#, json!({"a": 1, "b": null})),
            (br#"{"a": 1, "b":"#, json!({"a": 1, "b": null})),
            (br#"{"a": 1,"#, json!({"a": 1})),
            (br#"{"a": tr"#, json!({"a": null})),
            (b"{\"a\": \"esc\\u00", json!({"a": "esc"})),
            (b"", Value::Null),
        ];
        for (input, expected) in cases {
            let (out, result) = repaired(input);
            assert_eq!(result, Err(JsonError::Incomplete), "{out}");
            let parsed: Value = serde_json::from_str(&out).unwrap_or_else(|e| panic!("{out}: {e}"));
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn test_every_truncation_point_is_repairable() {
        let document = serde_json::to_vec_pretty(&json!({
            "report": {"id": "A-B", "timestamp": 1_700_000_000_000_000u64},
            "crash": {"threads": [{"index": 0, "name": "main \u{e9}\\\"", "regs": [1.5, -2, null, false]}]},
            "empty": [], "obj": {}
        }))
        .unwrap();
        for cut in 0..=document.len() {
            let (out, result) = repaired(&document[..cut]);
            serde_json::from_str::<Value>(&out).unwrap_or_else(|e| panic!("cut {cut}: {out}: {e}"));
            assert_eq!(result.is_ok(), cut == document.len(), "cut {cut}");
        }
    }

    #[test]
    fn test_invalid_input_still_closes() {
        let (out, result) = repaired(br#"{"a": [1, @"#);
        assert_eq!(result, Err(JsonError::InvalidCharacter));
        assert_eq!(
            serde_json::from_str::<Value>(&out).unwrap(),
            json!({"a": [1]})
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_json_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("old.json");
        let mut content = br##"{"report": {"id": "1"}, "crash": {"threads": [{"index": 0}, {"ind""##.to_vec();
        content.extend(std::iter::repeat(b' ').take(3000));
        std::fs::write(&path, &content)?;
        let c_path = std::ffi::CString::new(path.to_str().unwrap())?;

        let mut e = encoder();
        e.begin_object(None)?;
        assert_eq!(
            e.add_json_from_file(Some("recrash_report"), &c_path, true),
            Err(JsonError::Incomplete)
        );
        e.add_integer_element(Some("after"), 1)?;
        e.end_encode()?;
        let parsed: Value = serde_json::from_str(&output(e))?;
        assert_eq!(parsed["recrash_report"]["report"]["id"], "1");
        assert_eq!(parsed["recrash_report"]["crash"]["threads"][1]["ind"], Value::Null);
        assert_eq!(parsed["after"], 1);

        let mut e = encoder();
        e.begin_object(None)?;
        assert!(e.add_json_from_file(Some("x"), c"/nonexistent/crashee.json", true).is_err());
        e.end_encode()?;
        assert_eq!(output(e), "{}");
        Ok(())
    }

    #[test]
    fn test_number_grammar() {
        for ok in ["0", "-0", "12", "1.5", "-1.5e10", "2E-3", "3e+7"] {
            assert!(is_valid_number(ok.as_bytes()), "{ok}");
        }
        for bad in ["-", "01", "1.", ".5", "1e", "1e+", "+1", "0x10", "1.2.3"] {
            assert!(!is_valid_number(bad.as_bytes()), "{bad}");
        }
        assert!(validate(b"  [true, false, null] ").is_ok());
    }
}
