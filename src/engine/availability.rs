use chrono::{DateTime, Utc};

use crate::model::*;
use crate::pricing::PricingPolicy;

// ── Occupancy projection ──────────────────────────────────────────

/// True if a confirmed or active booking on this timeline covers `as_of`.
pub fn occupied_at(timeline: &SpaceTimeline, as_of: Ms) -> bool {
    timeline
        .blocking(&Span::new(as_of, as_of + 1))
        .any(|b| b.span.contains_instant(as_of))
}

/// Time-window occupancy: a space is unavailable when it is under maintenance
/// or `occupied(space)` reports a booking covering the instant being projected.
/// Stored reserved/occupied flags are not consulted.
pub fn project_occupancy(location: &ParkingLocation, occupied: impl Fn(&ParkingSpace) -> bool) -> Occupancy {
    let total = location.total_spaces();
    let unavailable = location
        .spaces
        .iter()
        .filter(|s| s.status == SpaceStatus::Maintenance || occupied(s))
        .count() as u32;
    let available = total.saturating_sub(unavailable);
    Occupancy {
        location_id: location.id,
        total_spaces: total,
        available_spaces: available,
        occupancy_percentage: occupancy_percentage(total, available),
    }
}

// ── Slot enumeration ──────────────────────────────────────────────

/// Partition `window` into `width`-wide slots (the last one may be shorter)
/// and mark each unavailable if a blocking booking overlaps it. A space under
/// maintenance has no available slots.
pub fn enumerate_slots(
    window: &Span,
    width: Ms,
    timeline: &SpaceTimeline,
    space: &ParkingSpace,
    hourly_rate: Money,
    policy: &PricingPolicy,
) -> Vec<Slot> {
    let mut slots = Vec::new();
    if width <= 0 {
        return slots;
    }
    let in_service = space.status != SpaceStatus::Maintenance;
    let mut start = window.start;
    while start < window.end {
        let end = (start + width).min(window.end);
        let span = Span::new(start, end);
        slots.push(Slot {
            start,
            end,
            available: in_service && timeline.blocking(&span).next().is_none(),
            price: policy.slot_price(&span, hourly_rate, space.space_type),
        });
        start = end;
    }
    slots
}

// ── Free windows ──────────────────────────────────────────────────

/// Opening windows of `hours` that intersect `window`, clipped to it.
pub fn opening_windows(hours: &OperatingHours, window: &Span) -> Vec<Span> {
    let (Some(first), Some(last)) = (
        DateTime::<Utc>::from_timestamp_millis(window.start),
        DateTime::<Utc>::from_timestamp_millis(window.end),
    ) else {
        return Vec::new();
    };
    // An overnight window opened the day before may reach into `window`.
    let mut day = first.date_naive().pred_opt().unwrap_or(first.date_naive());
    let last_day = last.date_naive();
    let mut open = Vec::new();
    while day <= last_day {
        let w = hours.window_on(day);
        let clipped_start = w.start.max(window.start);
        let clipped_end = w.end.min(window.end);
        if clipped_start < clipped_end {
            open.push(Span::new(clipped_start, clipped_end));
        }
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    open.sort_by_key(|s| s.start);
    merge_overlapping(&open)
}

/// Gaps inside the sorted, disjoint `open` spans not covered by a blocking
/// booking, at least `min_duration` long.
pub fn free_windows(open: &[Span], timeline: &SpaceTimeline, min_duration: Ms) -> Vec<Span> {
    let (Some(first), Some(last)) = (open.first(), open.last()) else {
        return Vec::new();
    };
    let bounds = Span::new(first.start, last.end);
    let mut busy: Vec<Span> = timeline
        .blocking(&bounds)
        .map(|b| Span::new(b.span.start.max(bounds.start), b.span.end.min(bounds.end)))
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(open, &busy)
        .into_iter()
        .filter(|s| s.duration_ms() >= min_duration)
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
