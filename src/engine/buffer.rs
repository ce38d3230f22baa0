use crate::model::{MINUTE, ServiceDefinition, Span};

/// Expand a requested window by the service's preparation and cleanup
/// minutes. Negative buffers count as zero.
pub fn expand(service: &ServiceDefinition, requested: Span) -> Span {
    expand_by(requested, service.prep_minutes, service.cleanup_minutes)
}

pub fn expand_by(requested: Span, prep_minutes: i64, cleanup_minutes: i64) -> Span {
    Span::new(
        requested.start - prep_minutes.max(0) * MINUTE,
        requested.end + cleanup_minutes.max(0) * MINUTE,
    )
}
