//! Conversions at the FFI boundary: arguments into C strings, engine
//! buffers into values. Raw bytes never leave this module.

use e4s_error::{NativeError, OpFailure, Result, ShimError};
use e4s_types::ArgumentError;
use serde::de::DeserializeOwned;
use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;

/// Bytes of a malformed payload kept for diagnostics.
pub(crate) const PAYLOAD_PREVIEW: usize = 2000;

pub(crate) fn cstring(what: &'static str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| ShimError::InvalidArgument(ArgumentError::InteriorNul { what }.to_string()))
}

/// Host paths cross the boundary as UTF-8 on every platform.
pub(crate) fn host_path(what: &'static str, path: &Path) -> Result<CString> {
    let text = path.to_str().ok_or_else(|| {
        ShimError::InvalidArgument(format!("{what} {} is not valid UTF-8", path.display()))
    })?;
    cstring(what, text)
}

/// Zero-status check for calls without an output payload.
pub(crate) fn check(status: c_int, err: &[u8], default: &str) -> std::result::Result<(), NativeError> {
    if status == 0 {
        Ok(())
    } else {
        Err(NativeError::from_buffer(status, err, default))
    }
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(PAYLOAD_PREVIEW)]).into_owned()
}

/// The text before the payload's terminating NUL.
///
/// Unlike the error channel, a payload is only trusted when the engine
/// terminated it and it is valid UTF-8.
pub(crate) fn payload_text(buf: &[u8]) -> std::result::Result<&str, OpFailure> {
    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(OpFailure::Decode {
            detail: format!("payload fills all {} bytes without a terminator", buf.len()),
            payload: preview(buf),
        });
    };
    std::str::from_utf8(&buf[..end]).map_err(|e| OpFailure::Decode {
        detail: format!("payload is not UTF-8: {e}"),
        payload: preview(&buf[..end]),
    })
}

pub(crate) fn decode_payload<T: DeserializeOwned>(buf: &[u8]) -> std::result::Result<T, OpFailure> {
    let text = payload_text(buf)?;
    serde_json::from_str(text).map_err(|e| OpFailure::Decode {
        detail: e.to_string(),
        payload: preview(text.as_bytes()),
    })
}
