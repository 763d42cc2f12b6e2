/// Process-wide last-error channel.
///
/// Holds a single message, overwritten by each failing operation and never
/// cleared on success. Host bindings check a sentinel return first and only
/// then read the message.
use std::ffi::{CStr, CString, c_char};
use std::sync::Mutex;

use tracing::warn;

use crate::error::BridgeError;

static LAST_ERROR: Mutex<Option<CString>> = Mutex::new(None);

/// Store `message`, replacing whatever was recorded before.
///
/// Interior NUL bytes cannot cross a C string boundary and are replaced
/// with U+FFFD.
pub fn set_last_error(message: &str) {
    let message = CString::new(message).unwrap_or_else(|_| {
        CString::new(message.replace('\0', "\u{FFFD}")).unwrap_or_default()
    });
    let mut slot = LAST_ERROR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(message);
}

/// Log `err` and write it to the channel.
pub fn record(err: &BridgeError) {
    warn!("{err}");
    set_last_error(&err.to_string());
}

/// Return a copy of the current message. Empty if nothing ever failed.
#[must_use]
pub fn last_error() -> String {
    let slot = LAST_ERROR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.as_ref()
        .map(|msg| msg.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Pointer to the current message.
///
/// Valid until the next `set_last_error`, which drops the previous `CString`.
pub(crate) fn last_error_ptr() -> *const c_char {
    const EMPTY: &CStr = c"";
    let slot = LAST_ERROR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.as_deref().unwrap_or(EMPTY).as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;

    #[test]
    fn test_set_overwrites_previous() {
        let _guard = serial();
        set_last_error("first failure");
        set_last_error("second failure");
        assert_eq!(last_error(), "second failure");
    }

    #[test]
    fn test_interior_nul_is_replaced() {
        let _guard = serial();
        set_last_error("bad\0message");
        assert_eq!(last_error(), "bad\u{FFFD}message");
    }

    #[test]
    fn test_ptr_matches_message() {
        let _guard = serial();
        set_last_error("pointer check");
        let ptr = last_error_ptr();
        let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(text, "pointer check");
    }

    #[test]
    fn test_record_uses_display() {
        let _guard = serial();
        record(&BridgeError::UnknownEmbedder(42));
        assert_eq!(last_error(), "unknown embedder handle 42");
    }
}
