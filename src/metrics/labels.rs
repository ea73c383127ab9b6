//! Metric names and label values

/// Outbound connections established
pub const CONNECTIONS_OPENED: &str = "tls_sockets_connections_opened_total";
/// Outbound connections that failed before being established
pub const CONNECTIONS_FAILED: &str = "tls_sockets_connections_failed_total";
/// Inbound connections accepted by servers
pub const CONNECTIONS_ACCEPTED: &str = "tls_sockets_connections_accepted_total";
/// In-place upgrades, by result
pub const UPGRADES: &str = "tls_sockets_upgrades_total";
/// TLS handshake duration in milliseconds
pub const HANDSHAKE_DURATION_MS: &str = "tls_sockets_handshake_duration_ms";

/// Successful outcome
pub const RESULT_OK: &str = "ok";
/// Failed outcome
pub const RESULT_FAILED: &str = "failed";
