use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("end time must be after start time"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Every confirmed or active booking on this timeline overlapping `span`,
/// except `exclude`. Pure read; the caller holds the timeline lock.
pub fn find_conflicts(timeline: &SpaceTimeline, span: &Span, exclude: Option<Ulid>) -> Vec<ConflictInfo> {
    timeline
        .blocking(span)
        .filter(|b| Some(b.id) != exclude)
        .map(ConflictInfo::from)
        .collect()
}

pub(crate) fn ensure_no_conflict(
    timeline: &SpaceTimeline,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(timeline, span, exclude);
    if conflicts.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL).increment(1);
        Err(EngineError::Conflict { conflicts })
    }
}
