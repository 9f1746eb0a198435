//! Field validation and schema-version policy for incoming events (§4.1).

use std::collections::HashSet;

use model::Event;

const ONE_HOUR_MS: i64 = 3_600_000;

/// Why an event was rejected before being queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A required field was missing, empty, or out of range.
    Validation(String),
    /// `schema_version` is not in the known set and strict mode is active.
    UnknownSchemaVersion(String),
}

impl Rejection {
    /// A short machine-readable reason string for counters/logs.
    pub fn as_str(&self) -> &str {
        match self {
            Rejection::Validation(reason) => reason,
            Rejection::UnknownSchemaVersion(_) => "unknown_schema_version",
        }
    }
}

/// How unknown `schema_version` values are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaValidationMode {
    /// Unknown versions are rejected.
    Strict,
    /// Unknown versions are accepted and tagged for observability.
    Lenient,
}

/// Validates field-level invariants and schema-version policy. `now_ms` is
/// wall-clock at validation time; `known_versions` is the configured set of
/// schema versions accepted without a lenient-mode tag.
pub fn validate(
    event: &Event,
    now_ms: i64,
    known_versions: &HashSet<String>,
    mode: SchemaValidationMode,
) -> Result<(), Rejection> {
    if event.event_id.trim().is_empty() {
        return Err(Rejection::Validation("event_id must be non-empty".into()));
    }
    if event.client_id.trim().is_empty() {
        return Err(Rejection::Validation("client_id must be non-empty".into()));
    }
    if event.ts_ms <= 0 {
        return Err(Rejection::Validation("ts_ms must be positive".into()));
    }
    if event.ts_ms > now_ms + ONE_HOUR_MS {
        return Err(Rejection::Validation("ts_ms more than one hour in the future".into()));
    }
    if event.schema_version.trim().is_empty() {
        return Err(Rejection::Validation("schema_version must be non-empty".into()));
    }
    if event.target.trim().is_empty() {
        return Err(Rejection::Validation("target must be non-empty".into()));
    }
    if event.network_context.interface_type.trim().is_empty() {
        return Err(Rejection::Validation("network_context.interface_type must be non-empty".into()));
    }
    if event.error_stage.is_none() {
        let timings = &event.timings;
        if timings.dns_ms < 0.0 || timings.tcp_ms < 0.0 || timings.tls_ms < 0.0 || timings.http_ttfb_ms < 0.0 {
            return Err(Rejection::Validation("timings must be non-negative".into()));
        }
    }

    if !known_versions.is_empty() && !known_versions.contains(&event.schema_version) && mode == SchemaValidationMode::Strict {
        return Err(Rejection::UnknownSchemaVersion(event.schema_version.clone()));
    }

    Ok(())
}
