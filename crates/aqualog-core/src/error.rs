//! Shared helpers for the error enums of this crate.

use core::fmt::Write;

/// Fixed-capacity detail string carried by error variants.
pub type ErrorDetail = heapless::String<64>;

/// Copies `msg` into an [`ErrorDetail`], truncating at capacity.
pub fn detail(msg: &str) -> ErrorDetail {
    let mut out = ErrorDetail::new();
    for c in msg.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Formats any displayable value into an [`ErrorDetail`].
pub fn detail_of(value: impl core::fmt::Display) -> ErrorDetail {
    let mut out = ErrorDetail::new();
    let _ = write!(out, "{}", value);
    out
}
