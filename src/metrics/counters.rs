//! Counter metrics

use super::labels;

/// Record an established outbound connection
pub fn connection_opened(secure: bool) {
    metrics::counter!(
        labels::CONNECTIONS_OPENED,
        "secure" => if secure { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a failed outbound connection
pub fn connection_failed(category: &'static str) {
    metrics::counter!(labels::CONNECTIONS_FAILED, "error" => category).increment(1);
}

/// Record an accepted inbound connection
pub fn connection_accepted() {
    metrics::counter!(labels::CONNECTIONS_ACCEPTED).increment(1);
}

/// Record the outcome of an in-place upgrade
pub fn upgrade(result: &'static str) {
    metrics::counter!(labels::UPGRADES, "result" => result).increment(1);
}
