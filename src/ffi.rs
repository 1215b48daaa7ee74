//! FFI interface for C/C++ hosts
//!
//! HTML is passed as a pointer plus length, schemas as null-terminated JSON.
//! Every result is JSON text owned by Rust and must be released with
//! [`free_extraction_result`].

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use serde_json::Value;

use crate::config::config;
use crate::engine::extract;
use crate::query::HtmlDocument;
use crate::reduce::reduce_html;
use crate::schema::ExtractionSchema;

/// Result struct returned to the host
/// Both pointers are owned by Rust and must be freed via free_extraction_result
#[repr(C)]
pub struct ExtractionResultFFI {
    /// JSON-serialized result (null-terminated), or null on failure
    pub json_ptr: *mut c_char,
    /// Error message if the call failed (null-terminated), or null on success
    pub error_ptr: *mut c_char,
}

/// Apply a JSON extraction schema to an HTML document.
///
/// # Arguments
/// * `html_ptr` - Pointer to HTML content (UTF-8, not necessarily null-terminated)
/// * `html_len` - Length of HTML content in bytes
/// * `schema_json` - JSON-serialized extraction schema (null-terminated)
///
/// # Returns
/// ExtractionResultFFI with the extracted JSON object in `json_ptr`, or
/// `error_ptr` set when the input or the schema's top level is unusable.
/// Fields that match nothing are `null` in the result, never errors.
///
/// # Safety
/// - `html_ptr` must point to valid memory of at least `html_len` bytes
/// - `schema_json` must be a valid null-terminated C string
/// - Caller must free the result via `free_extraction_result`
#[no_mangle]
pub unsafe extern "C" fn extract_with_schema(
    html_ptr: *const c_char,
    html_len: usize,
    schema_json: *const c_char,
) -> ExtractionResultFFI {
    let html = match read_html(html_ptr, html_len) {
        Ok(html) => html,
        Err(msg) => return make_error_result(msg),
    };

    if schema_json.is_null() {
        return make_error_result("Schema JSON is null");
    }
    let schema_str = match CStr::from_ptr(schema_json).to_str() {
        Ok(s) => s,
        Err(_) => return make_error_result("Invalid UTF-8 in schema JSON"),
    };

    let schema = match ExtractionSchema::from_json_str(schema_str) {
        Ok(schema) => schema,
        Err(e) => return make_error_result(&format!("Failed to parse schema: {}", e)),
    };

    let document = HtmlDocument::parse(html);
    make_json_result(&extract(&document, &schema))
}

/// Reduce an HTML document for schema generation, using the installed
/// configuration's reduction settings. The result is a JSON string.
///
/// # Safety
/// Same as extract_with_schema
#[no_mangle]
pub unsafe extern "C" fn reduce_html_ffi(html_ptr: *const c_char, html_len: usize) -> ExtractionResultFFI {
    let html = match read_html(html_ptr, html_len) {
        Ok(html) => html,
        Err(msg) => return make_error_result(msg),
    };

    let reduced = reduce_html(html, &config().reduction);
    make_json_result(&Value::String(reduced))
}

/// Free an ExtractionResultFFI returned by this module
///
/// # Safety
/// - `result` must have been returned by one of the functions above
/// - Must only be called once per result
#[no_mangle]
pub unsafe extern "C" fn free_extraction_result(result: ExtractionResultFFI) {
    if !result.json_ptr.is_null() {
        drop(CString::from_raw(result.json_ptr));
    }
    if !result.error_ptr.is_null() {
        drop(CString::from_raw(result.error_ptr));
    }
}

// A null pointer or zero length is an empty document
unsafe fn read_html<'a>(html_ptr: *const c_char, html_len: usize) -> Result<&'a str, &'static str> {
    if html_ptr.is_null() || html_len == 0 {
        return Ok("");
    }
    let slice = std::slice::from_raw_parts(html_ptr as *const u8, html_len);
    std::str::from_utf8(slice).map_err(|_| "Invalid UTF-8 in HTML content")
}

fn make_json_result(value: &Value) -> ExtractionResultFFI {
    match serde_json::to_string(value) {
        Ok(json) => match CString::new(json) {
            Ok(cstr) => ExtractionResultFFI {
                json_ptr: cstr.into_raw(),
                error_ptr: ptr::null_mut(),
            },
            Err(_) => make_error_result("Result JSON contains null bytes"),
        },
        Err(e) => make_error_result(&format!("Failed to serialize result: {}", e)),
    }
}

fn make_error_result(msg: &str) -> ExtractionResultFFI {
    let error_cstr = CString::new(msg.replace('\0', "")).unwrap_or_default();
    ExtractionResultFFI {
        json_ptr: ptr::null_mut(),
        error_ptr: error_cstr.into_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HTML: &str = r#"
    <html><body>
        <h1>Catalog</h1>
        <script>var tracking = true;</script>
        <ul><li>one</li><li>two</li></ul>
    </body></html>
    "#;

    // Returns (json, error) and frees the result
    unsafe fn take(result: ExtractionResultFFI) -> (Option<String>, Option<String>) {
        let json = (!result.json_ptr.is_null())
            .then(|| CStr::from_ptr(result.json_ptr).to_string_lossy().into_owned());
        let error = (!result.error_ptr.is_null())
            .then(|| CStr::from_ptr(result.error_ptr).to_string_lossy().into_owned());
        free_extraction_result(result);
        (json, error)
    }

    #[test]
    fn test_extract_with_schema() {
        let schema = CString::new(
            r#"{"title": {"xpath": "//h1", "type": "string"},
                "items": {"type": "array", "container_xpath": "//li", "items": {"xpath": ".", "type": "string"}}}"#,
        )
        .unwrap();

        let (json, error) = unsafe {
            take(extract_with_schema(
                HTML.as_ptr() as *const c_char,
                HTML.len(),
                schema.as_ptr(),
            ))
        };

        assert!(error.is_none());
        let value: Value = serde_json::from_str(&json.unwrap()).unwrap();
        assert_eq!(value, json!({ "title": "Catalog", "items": ["one", "two"] }));
    }

    #[test]
    fn test_invalid_schema_sets_error() {
        let schema = CString::new(r#"["not", "a", "mapping"]"#).unwrap();
        let (json, error) = unsafe {
            take(extract_with_schema(
                HTML.as_ptr() as *const c_char,
                HTML.len(),
                schema.as_ptr(),
            ))
        };
        assert!(json.is_none());
        assert!(error.unwrap().starts_with("Failed to parse schema: Invalid schema"));
    }

    #[test]
    fn test_null_schema_and_bad_utf8() {
        let (_, error) = unsafe { take(extract_with_schema(ptr::null(), 0, ptr::null())) };
        assert_eq!(error.as_deref(), Some("Schema JSON is null"));

        let bytes = [0x3c_u8, 0xff, 0xfe];
        let schema = CString::new("{}").unwrap();
        let (_, error) = unsafe {
            take(extract_with_schema(
                bytes.as_ptr() as *const c_char,
                bytes.len(),
                schema.as_ptr(),
            ))
        };
        assert_eq!(error.as_deref(), Some("Invalid UTF-8 in HTML content"));
    }

    #[test]
    fn test_empty_document_yields_nulls() {
        let schema = CString::new(r#"{"title": {"xpath": "//h1", "type": "string"}}"#).unwrap();
        let (json, _) = unsafe { take(extract_with_schema(ptr::null(), 0, schema.as_ptr())) };
        assert_eq!(json.as_deref(), Some(r#"{"title":null}"#));
    }

    #[test]
    fn test_reduce_html_ffi() {
        let (json, error) = unsafe { take(reduce_html_ffi(HTML.as_ptr() as *const c_char, HTML.len())) };
        assert!(error.is_none());

        let reduced: String = serde_json::from_str(&json.unwrap()).unwrap();
        assert!(reduced.contains("<h1>Catalog</h1>"));
        assert!(!reduced.contains("tracking"));
    }
}
