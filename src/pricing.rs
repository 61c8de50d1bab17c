use serde::{Deserialize, Serialize};

use crate::model::*;

/// Fee and refund rules. Multipliers are integer percentages (150 = ×1.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub regular_pct: u32,
    pub handicapped_pct: u32,
    pub ev_charging_pct: u32,
    pub reserved_pct: u32,
    pub overstay_pct: u32,
    /// Cancelling more than this far ahead refunds everything.
    pub full_refund_notice_ms: Ms,
    /// Cancelling more than this far ahead (but inside the full window) refunds `partial_refund_pct`.
    pub partial_refund_notice_ms: Ms,
    pub partial_refund_pct: u8,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            regular_pct: 100,
            handicapped_pct: 100,
            ev_charging_pct: 120,
            reserved_pct: 150,
            overstay_pct: 150,
            full_refund_notice_ms: 24 * HOUR_MS,
            partial_refund_notice_ms: 2 * HOUR_MS,
            partial_refund_pct: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverstayCharge {
    pub hours: i64,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundQuote {
    pub amount: Money,
    pub percentage: u8,
    pub status: RefundStatus,
}

fn apply_pct(amount: Money, pct: u32) -> Money {
    amount * Money::from(pct) / 100
}

impl PricingPolicy {
    pub fn type_multiplier_pct(&self, space_type: SpaceType) -> u32 {
        match space_type {
            SpaceType::Regular => self.regular_pct,
            SpaceType::Handicapped => self.handicapped_pct,
            SpaceType::EvCharging => self.ev_charging_pct,
            SpaceType::Reserved => self.reserved_pct,
        }
    }

    /// `ceil(hours) × rate × type multiplier`.
    pub fn base_amount(&self, span: &Span, hourly_rate: Money, space_type: SpaceType) -> Money {
        apply_pct(
            span.billable_hours() * hourly_rate,
            self.type_multiplier_pct(space_type),
        )
    }

    /// Price of one enumerated slot; same formula as a booking of that slot.
    pub fn slot_price(&self, slot: &Span, hourly_rate: Money, space_type: SpaceType) -> Money {
        self.base_amount(slot, hourly_rate, space_type)
    }

    /// `ceil(new_end - old_end) × rate`. The space-type multiplier is not reapplied.
    pub fn extension_amount(&self, old_end: Ms, new_end: Ms, hourly_rate: Money) -> Money {
        ceil_hours(new_end - old_end) * hourly_rate
    }

    /// Charge for leaving after the booked end, or `None` when on time.
    pub fn overstay_penalty(&self, booked_end: Ms, actual_exit: Ms, hourly_rate: Money) -> Option<OverstayCharge> {
        if actual_exit <= booked_end {
            return None;
        }
        let hours = ceil_hours(actual_exit - booked_end);
        Some(OverstayCharge {
            hours,
            amount: apply_pct(hours * hourly_rate, self.overstay_pct),
        })
    }

    /// Refund percentage from notice given before the booked start.
    pub fn refund_percentage(&self, start: Ms, now: Ms) -> u8 {
        let notice = start - now;
        if notice > self.full_refund_notice_ms {
            100
        } else if notice > self.partial_refund_notice_ms {
            self.partial_refund_pct
        } else {
            0
        }
    }

    /// Refund owed on cancellation. Only completed payments are refundable.
    pub fn refund_quote(
        &self,
        total_amount: Money,
        payment_status: PaymentStatus,
        start: Ms,
        now: Ms,
    ) -> RefundQuote {
        let percentage = self.refund_percentage(start, now);
        if payment_status != PaymentStatus::Completed {
            return RefundQuote {
                amount: 0,
                percentage,
                status: RefundStatus::NotApplicable,
            };
        }
        let amount = apply_pct(total_amount, u32::from(percentage));
        let status = if amount > 0 {
            RefundStatus::Pending
        } else {
            RefundStatus::NotApplicable
        };
        RefundQuote {
            amount,
            percentage,
            status,
        }
    }
}
