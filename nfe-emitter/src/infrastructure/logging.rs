//! Helpers for the tracing spans opened around emission steps.

use std::fmt::Debug;
use tracing::{warn, Span};

/// Record `field_value` for `field_name` on the current span. The field must
/// already be declared by the span, e.g. with
/// `#[instrument(fields(access_key))]`.
///
/// Every event emitted inside the span then carries the value:
/// ```text
///   2024-05-14T13:02:51.118204Z  INFO nfe_emitter_client::transmission: Batch received, polling receipt.
///     in nfe_emitter_client::api::emit::emit_invoice with request_id: 7c1d..., access_key: "2924051234..."
/// ```
///
/// Debug builds warn when the field was not declared, since the value would
/// otherwise be dropped silently.
pub fn record_field(field_name: &str, field_value: &dyn Debug) {
    if cfg!(debug_assertions) && !Span::current().has_field(field_name) {
        warn!("Field {} not defined in current span!", field_name);
    }

    let _ = Span::current().record(field_name, &format!("{field_value:?}"));
}

/// Shortens a raw payload before it is attached to a log event. Authority
/// replies can carry whole signed documents.
pub fn truncate_for_log(payload: &str, max_chars: usize) -> String {
    match payload.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... ({} bytes)", &payload[..cut], payload.len()),
        None => payload.to_string(),
    }
}
