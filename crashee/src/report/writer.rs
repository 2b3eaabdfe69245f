// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The element-level interface reports are written through.
//!
//! Every operation is infallible from the caller's point of view: a failed element is logged
//! and skipped, so that the rest of the report still gets written.

use super::buffered_writer::BufferedReader;
use super::json_codec::{JsonEncoder, JsonError, JsonResult, JsonSink};
use crate::shared::fields;
use crate::shared::fmt_buf::FmtBuf;
use std::ffi::CStr;
use std::fmt::Write as _;

const TEXT_FILE_LINE_CAPACITY: usize = 1024;

/// Writes the elements of a report. Keys are ignored inside arrays.
///
/// An implementation is handed to the user section callback, so applications can add their
/// own fields to the `user` block of a crash report.
pub trait ReportWriter {
    fn add_boolean_element(&mut self, key: Option<&str>, value: bool);
    fn add_floating_point_element(&mut self, key: Option<&str>, value: f64);
    fn add_integer_element(&mut self, key: Option<&str>, value: i64);
    fn add_uinteger_element(&mut self, key: Option<&str>, value: u64);
    fn add_string_element(&mut self, key: Option<&str>, value: &str);

    /// Adds the contents of a text file as one string.
    fn add_text_file_element(&mut self, key: Option<&str>, path: &CStr);

    /// Adds the lines of a text file as an array of strings.
    fn add_text_file_lines_element(&mut self, key: Option<&str>, path: &CStr);

    /// Adds the JSON document stored in a file, completing it if it was cut short.
    fn add_json_file_element(&mut self, key: Option<&str>, path: &CStr, close_last_container: bool);

    /// Adds binary data, hex encoded.
    fn add_data_element(&mut self, key: Option<&str>, data: &[u8]);
    fn begin_data_element(&mut self, key: Option<&str>);
    fn append_data_element(&mut self, data: &[u8]);
    fn end_data_element(&mut self);

    /// Adds a UUID in its textual form, or null.
    fn add_uuid_element(&mut self, key: Option<&str>, uuid: Option<&[u8; 16]>);

    /// Adds pre-encoded JSON. Malformed JSON is replaced by an object holding the error and the
    /// raw text. With `close_last_container` false, an object or array is left open.
    fn add_json_element(&mut self, key: Option<&str>, json: &str, close_last_container: bool);

    fn begin_object(&mut self, key: Option<&str>);
    fn begin_array(&mut self, key: Option<&str>);
    fn end_container(&mut self);
}

/// [ReportWriter] over a streaming JSON encoder.
pub struct JsonReportWriter<W: JsonSink> {
    encoder: JsonEncoder<W>,
}

impl<W: JsonSink> JsonReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            encoder: JsonEncoder::new(sink, true),
        }
    }

    pub fn encoder(&mut self) -> &mut JsonEncoder<W> {
        &mut self.encoder
    }

    pub fn flush(&mut self) {
        if !self.encoder.flush() {
            crash_error!("Could not flush report");
        }
    }

    /// Closes every open container and flushes.
    pub fn finish(mut self) -> W {
        let result = self.encoder.end_encode();
        self.check(result, "end report");
        self.flush();
        self.encoder.into_sink()
    }

    fn check(&self, result: JsonResult, element: &str) {
        if let Err(e) = result {
            crash_error!("Could not {}: {}", element, e);
        }
    }
}

impl<W: JsonSink> ReportWriter for JsonReportWriter<W> {
    fn add_boolean_element(&mut self, key: Option<&str>, value: bool) {
        let result = self.encoder.add_boolean_element(key, value);
        self.check(result, "add boolean");
    }

    fn add_floating_point_element(&mut self, key: Option<&str>, value: f64) {
        let result = self.encoder.add_floating_point_element(key, value);
        self.check(result, "add floating point");
    }

    fn add_integer_element(&mut self, key: Option<&str>, value: i64) {
        let result = self.encoder.add_integer_element(key, value);
        self.check(result, "add integer");
    }

    fn add_uinteger_element(&mut self, key: Option<&str>, value: u64) {
        let result = self.encoder.add_uinteger_element(key, value);
        self.check(result, "add unsigned integer");
    }

    fn add_string_element(&mut self, key: Option<&str>, value: &str) {
        let result = self.encoder.add_string_element(key, value);
        self.check(result, "add string");
    }

    fn add_text_file_element(&mut self, key: Option<&str>, path: &CStr) {
        let mut reader = match BufferedReader::<512>::open(path) {
            Ok(reader) => reader,
            Err(errno) => {
                crash_error!("Could not open file {:?}: errno {}", path, errno);
                return;
            }
        };
        let result = self.encoder.begin_string_element(key);
        if let Err(e) = result {
            crash_error!("Could not start string element: {}", e);
            return;
        }
        loop {
            let chunk = reader.read_chunk();
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = self.encoder.append_string_element(chunk) {
                crash_error!("Could not append string element: {}", e);
                break;
            }
        }
        let result = self.encoder.end_string_element();
        self.check(result, "end string element");
    }

    fn add_text_file_lines_element(&mut self, key: Option<&str>, path: &CStr) {
        let mut reader = match BufferedReader::<TEXT_FILE_LINE_CAPACITY>::open(path) {
            Ok(reader) => reader,
            Err(errno) => {
                crash_error!("Could not open file {:?}: errno {}", path, errno);
                return;
            }
        };
        self.begin_array(key);
        while let Some(line) = reader.read_line() {
            if let Err(e) = self.encoder.add_bytes_string_element(None, line) {
                crash_error!("Could not add line: {}", e);
                break;
            }
        }
        self.end_container();
    }

    fn add_json_file_element(&mut self, key: Option<&str>, path: &CStr, close_last_container: bool) {
        let result = self.encoder.add_json_from_file(key, path, close_last_container);
        match result {
            Ok(()) | Err(JsonError::CannotAddData) => {}
            Err(e) => crash_warn!("JSON in {:?} had to be repaired: {}", path, e),
        }
    }

    fn add_data_element(&mut self, key: Option<&str>, data: &[u8]) {
        let result = self.encoder.add_data_element(key, data);
        self.check(result, "add data");
    }

    fn begin_data_element(&mut self, key: Option<&str>) {
        let result = self.encoder.begin_data_element(key);
        self.check(result, "begin data");
    }

    fn append_data_element(&mut self, data: &[u8]) {
        let result = self.encoder.append_data_element(data);
        self.check(result, "append data");
    }

    fn end_data_element(&mut self) {
        let result = self.encoder.end_data_element();
        self.check(result, "end data");
    }

    fn add_uuid_element(&mut self, key: Option<&str>, uuid: Option<&[u8; 16]>) {
        match uuid {
            Some(bytes) => {
                let mut buffer = [0u8; uuid::fmt::Hyphenated::LENGTH];
                let text = uuid::Uuid::from_bytes(*bytes)
                    .hyphenated()
                    .encode_upper(&mut buffer);
                self.add_string_element(key, text);
            }
            None => {
                let result = self.encoder.add_null_element(key);
                self.check(result, "add null");
            }
        }
    }

    fn add_json_element(&mut self, key: Option<&str>, json: &str, close_last_container: bool) {
        let Err(e) = self
            .encoder
            .add_json_element(key, json.as_bytes(), close_last_container)
        else {
            return;
        };
        let mut message = FmtBuf::<100>::new();
        let _ = write!(message, "Invalid JSON data: {e}");
        self.begin_object(key);
        self.add_string_element(Some(fields::ERROR), message.as_str());
        self.add_string_element(Some(fields::JSON_DATA), json);
        if close_last_container {
            self.end_container();
        }
    }

    fn begin_object(&mut self, key: Option<&str>) {
        let result = self.encoder.begin_object(key);
        self.check(result, "begin object");
    }

    fn begin_array(&mut self, key: Option<&str>) {
        let result = self.encoder.begin_array(key);
        self.check(result, "begin array");
    }

    fn end_container(&mut self) {
        let result = self.encoder.end_container();
        self.check(result, "end container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn parse(writer: JsonReportWriter<Vec<u8>>) -> Value {
        serde_json::from_slice(&writer.finish()).unwrap()
    }

    #[test]
    fn test_malformed_json_becomes_error_object() {
        let mut writer = JsonReportWriter::new(Vec::new());
        writer.begin_object(None);
        writer.add_json_element(Some("user"), r#"{"a": "#, true);
        writer.add_json_element(Some("ok"), "[1, 2]", true);
        let doc = parse(writer);
        assert_eq!(doc["user"]["json_data"], r#"{"a": "#);
        assert!(doc["user"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON data: "));
        assert_eq!(doc["ok"], json!([1, 2]));
    }

    #[test]
    fn test_open_user_section_takes_more_fields() {
        let mut writer = JsonReportWriter::new(Vec::new());
        writer.begin_object(None);
        writer.add_json_element(Some("user"), r#"{"account": "x"}"#, false);
        writer.add_integer_element(Some("extra"), 7);
        writer.end_container();
        writer.add_json_element(Some("broken"), "{", false);
        writer.add_boolean_element(Some("inside_error_object"), true);
        writer.end_container();
        let doc = parse(writer);
        assert_eq!(doc["user"], json!({"account": "x", "extra": 7}));
        assert_eq!(doc["broken"]["inside_error_object"], true);
    }

    #[test]
    fn test_uuid_element() {
        let mut writer = JsonReportWriter::new(Vec::new());
        writer.begin_object(None);
        writer.add_uuid_element(Some("some"), Some(&[0x0f; 16]));
        writer.add_uuid_element(Some("none"), None);
        let doc = parse(writer);
        assert_eq!(doc["some"], "0F0F0F0F-0F0F-0F0F-0F0F-0F0F0F0F0F0F");
        assert_eq!(doc["none"], Value::Null);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_text_file_elements() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ConsoleLog.txt");
        std::fs::write(&path, "line one\n\"quoted\" two\nthree")?;
        let c_path = CString::new(path.as_os_str().as_bytes())?;

        let mut writer = JsonReportWriter::new(Vec::new());
        writer.begin_object(None);
        writer.add_text_file_lines_element(Some("lines"), &c_path);
        writer.add_text_file_element(Some("text"), &c_path);
        writer.add_text_file_lines_element(Some("missing"), c"/nonexistent/ConsoleLog.txt");
        let doc = parse(writer);
        assert_eq!(doc["lines"], json!(["line one", "\"quoted\" two", "three"]));
        assert_eq!(doc["text"], "line one\n\"quoted\" two\nthree");
        assert!(doc.get("missing").is_none());
        Ok(())
    }
}
