//! Booking state machine.
//!
//! ```text
//! pending ──▶ confirmed ──▶ active ──▶ completed
//!    │            │  │         │
//!    │            │  │         └──▶ expired   (never checked out, past end + grace)
//!    │            │  └──▶ expired / no_show   (never checked in)
//!    └──▶ cancelled ◀──┘
//! ```
//!
//! Every function here is pure: it validates a transition against the booking
//! and mutates the booking in place. Locking, persistence and space status
//! belong to the engine.

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;
use crate::pricing::{OverstayCharge, PricingPolicy, RefundQuote};

pub fn allowed_transitions(from: BookingStatus) -> &'static [BookingStatus] {
    use BookingStatus::*;
    match from {
        Pending => &[Confirmed, Cancelled, Expired],
        Confirmed => &[Active, Cancelled, Expired, NoShow],
        Active => &[Completed, Expired],
        Completed | Cancelled | Expired | NoShow => &[],
    }
}

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

fn rejected(from: BookingStatus, action: &'static str, hint: Option<&'static str>) -> EngineError {
    EngineError::InvalidTransition {
        from,
        action,
        allowed: allowed_transitions(from).to_vec(),
        hint,
    }
}

fn ensure(b: &Booking, to: BookingStatus, action: &'static str) -> Result<(), EngineError> {
    if can_transition(b.status, to) {
        Ok(())
    } else {
        Err(rejected(b.status, action, None))
    }
}

pub fn ensure_owner(b: &Booking, requester: &str, action: &'static str) -> Result<(), EngineError> {
    if b.user_id == requester {
        Ok(())
    } else {
        Err(EngineError::Permission {
            actor: requester.to_string(),
            action,
        })
    }
}

/// Status a booking should be in at `now`, if different from its stored one.
///
/// Idempotent: applying the result and reconciling again yields `None`.
/// An active booking is only expired once `active_grace` has passed after its
/// end, so a late checkout still completes (with an overstay penalty).
pub fn reconcile_state(b: &Booking, now: Ms, active_grace: Ms) -> Option<BookingStatus> {
    match b.status {
        BookingStatus::Pending | BookingStatus::Confirmed if now > b.span.end => {
            Some(BookingStatus::Expired)
        }
        BookingStatus::Active if b.actual_exit.is_none() && now > b.span.end + active_grace => {
            Some(BookingStatus::Expired)
        }
        _ => None,
    }
}

pub fn expire(b: &mut Booking, now: Ms) -> Result<(), EngineError> {
    ensure(b, BookingStatus::Expired, "expire")?;
    b.status = BookingStatus::Expired;
    b.updated_at = now;
    Ok(())
}

pub fn confirm_payment(b: &mut Booking, now: Ms) -> Result<(), EngineError> {
    ensure(b, BookingStatus::Confirmed, "confirm payment for")?;
    b.status = BookingStatus::Confirmed;
    b.payment_status = PaymentStatus::Completed;
    b.updated_at = now;
    Ok(())
}

/// A failed payment releases the reservation: the pending booking is cancelled.
pub fn fail_payment(b: &mut Booking, now: Ms) -> Result<(), EngineError> {
    if b.status != BookingStatus::Pending {
        return Err(rejected(b.status, "fail payment for", None));
    }
    b.status = BookingStatus::Cancelled;
    b.payment_status = PaymentStatus::Failed;
    b.cancellation = Some(Cancellation {
        cancelled_at: now,
        cancelled_by: "payment".to_string(),
        reason: Some("payment failed".to_string()),
        refund_amount: 0,
        refund_percentage: 0,
        refund_status: RefundStatus::NotApplicable,
    });
    b.updated_at = now;
    Ok(())
}

pub fn check_in(b: &mut Booking, now: Ms, presented_qr: Option<&str>) -> Result<(), EngineError> {
    ensure(b, BookingStatus::Active, "check in")?;
    if let Some(code) = presented_qr
        && code != b.qr_code
    {
        return Err(EngineError::validation("QR code does not match booking"));
    }
    if now < b.span.start {
        return Err(EngineError::validation("check-in is not open before the booked start"));
    }
    if now > b.span.end {
        return Err(EngineError::validation("booking window has already ended"));
    }
    b.status = BookingStatus::Active;
    b.actual_entry = Some(now);
    b.updated_at = now;
    Ok(())
}

/// Complete an active booking. Late exits append an overstay penalty.
pub fn check_out(
    b: &mut Booking,
    now: Ms,
    hourly_rate: Money,
    policy: &PricingPolicy,
) -> Result<Option<OverstayCharge>, EngineError> {
    ensure(b, BookingStatus::Completed, "check out")?;
    if b.actual_entry.is_none() {
        return Err(EngineError::validation("booking has no recorded entry"));
    }
    b.actual_exit = Some(now);
    let charge = policy.overstay_penalty(b.span.end, now, hourly_rate);
    if let Some(c) = charge {
        b.penalties.push(Penalty {
            kind: PenaltyKind::Overstay,
            amount: c.amount,
            description: format!("Overstayed by {} hour(s)", c.hours),
            issued_at: now,
            is_paid: false,
        });
    }
    b.status = BookingStatus::Completed;
    b.updated_at = now;
    Ok(charge)
}

pub fn cancel(
    b: &mut Booking,
    requester: &str,
    reason: Option<String>,
    now: Ms,
    policy: &PricingPolicy,
) -> Result<RefundQuote, EngineError> {
    ensure_owner(b, requester, "cancel booking")?;
    if b.status == BookingStatus::Active {
        return Err(rejected(b.status, "cancel", Some("check out instead of cancelling")));
    }
    ensure(b, BookingStatus::Cancelled, "cancel")?;
    if let Some(r) = &reason
        && r.len() > MAX_TEXT_LEN
    {
        return Err(EngineError::LimitExceeded("cancellation reason too long"));
    }

    let quote = policy.refund_quote(b.total_amount, b.payment_status, b.span.start, now);
    if quote.amount > 0 {
        b.payment_status = if quote.amount >= b.total_amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartialRefund
        };
    }
    b.cancellation = Some(Cancellation {
        cancelled_at: now,
        cancelled_by: requester.to_string(),
        reason,
        refund_amount: quote.amount,
        refund_percentage: quote.percentage,
        refund_status: quote.status,
    });
    b.status = BookingStatus::Cancelled;
    b.updated_at = now;
    Ok(quote)
}

/// Validate an extension request and return the window that must be free.
pub fn extension_window(b: &Booking, requester: &str, new_end: Ms) -> Result<Span, EngineError> {
    ensure_owner(b, requester, "extend booking")?;
    if !matches!(b.status, BookingStatus::Confirmed | BookingStatus::Active) {
        return Err(rejected(b.status, "extend", None));
    }
    if new_end <= b.span.end {
        return Err(EngineError::validation("new end time must be after the current end time"));
    }
    if new_end - b.span.start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    if b.extensions.len() >= MAX_EXTENSIONS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many extensions"));
    }
    Ok(Span::new(b.span.end, new_end))
}

pub fn apply_extension(b: &mut Booking, new_end: Ms, additional_amount: Money, now: Ms) {
    b.extensions.push(Extension {
        original_end: b.span.end,
        new_end,
        additional_amount,
        requested_at: now,
        approved: true,
    });
    b.total_amount += additional_amount;
    b.span.end = new_end;
    b.updated_at = now;
}

pub fn mark_no_show(b: &mut Booking, now: Ms) -> Result<(), EngineError> {
    ensure(b, BookingStatus::NoShow, "mark as no-show")?;
    if now < b.span.start {
        return Err(EngineError::validation("booking has not started yet"));
    }
    b.status = BookingStatus::NoShow;
    b.updated_at = now;
    Ok(())
}

pub fn issue_penalty(b: &mut Booking, penalty: Penalty) -> Result<(), EngineError> {
    if matches!(b.status, BookingStatus::Pending | BookingStatus::Cancelled) {
        return Err(rejected(b.status, "penalize", None));
    }
    if penalty.amount < 0 {
        return Err(EngineError::validation("penalty amount must not be negative"));
    }
    if penalty.description.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded("penalty description too long"));
    }
    if b.penalties.len() >= MAX_PENALTIES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many penalties"));
    }
    b.updated_at = penalty.issued_at;
    b.penalties.push(penalty);
    Ok(())
}

/// Mark every outstanding penalty paid. Returns how many changed.
pub fn settle_penalties(b: &mut Booking, now: Ms) -> usize {
    let mut settled = 0;
    for p in b.penalties.iter_mut().filter(|p| !p.is_paid) {
        p.is_paid = true;
        settled += 1;
    }
    if settled > 0 {
        b.updated_at = now;
    }
    settled
}
