//! Cache key layout. Keys are versioned so a format change can coexist with
//! markers written by an older release.

use crate::payments::types::Provider;

const VERSION: &str = "v1";

/// Marker for a fully processed provider webhook event
pub fn webhook_event(provider: Provider, event_id: &str) -> String {
    format!("{}:webhook:{}:{}", VERSION, provider.as_str(), event_id)
}
