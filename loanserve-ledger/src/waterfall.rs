//! Pure waterfall allocator (spec 4.3). No I/O: given an amount and the
//! loan's outstanding receivable buckets, compute how the amount is
//! consumed bucket by bucket, with any residual landing in suspense.

use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaterfallBucket {
    Fees,
    Interest,
    Principal,
    Escrow,
}

/// Each inner `Vec` is a priority group. Buckets within a group compete
/// proportionally for whatever amount is left when the group is reached;
/// groups themselves are applied strictly in order.
pub type WaterfallOrder = Vec<Vec<WaterfallBucket>>;

#[must_use]
pub fn default_waterfall_order() -> WaterfallOrder {
    vec![
        vec![WaterfallBucket::Fees],
        vec![WaterfallBucket::Interest],
        vec![WaterfallBucket::Principal],
        vec![WaterfallBucket::Escrow],
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outstanding {
    pub fees: Money,
    pub interest: Money,
    pub principal: Money,
    pub escrow: Money,
}

impl Outstanding {
    fn need(&self, bucket: WaterfallBucket) -> Money {
        match bucket {
            WaterfallBucket::Fees => self.fees,
            WaterfallBucket::Interest => self.interest,
            WaterfallBucket::Principal => self.principal,
            WaterfallBucket::Escrow => self.escrow,
        }
    }
}

/// The five-way split of an amount. `xF + xI + xP + xE + suspense` always
/// equals the amount allocated, by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub fees: i64,
    pub interest: i64,
    pub principal: i64,
    pub escrow: i64,
    pub suspense: i64,
}

impl Allocation {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.fees + self.interest + self.principal + self.escrow + self.suspense
    }

    #[must_use]
    pub fn all_non_negative(&self) -> bool {
        self.fees >= 0 && self.interest >= 0 && self.principal >= 0 && self.escrow >= 0 && self.suspense >= 0
    }

    /// Everything lands in suspense. Used by the poster when posting is
    /// not ready (loan unmatched, amount below threshold, risk too high)
    /// — real buckets are deferred to a later rematching step.
    #[must_use]
    pub fn suspense_only(amount: Money) -> Allocation {
        Allocation {
            suspense: amount.as_cents(),
            ..Allocation::default()
        }
    }
}

fn add_to_bucket(alloc: &mut Allocation, bucket: WaterfallBucket, amount: i64) {
    match bucket {
        WaterfallBucket::Fees => alloc.fees += amount,
        WaterfallBucket::Interest => alloc.interest += amount,
        WaterfallBucket::Principal => alloc.principal += amount,
        WaterfallBucket::Escrow => alloc.escrow += amount,
    }
}

/// Largest-remainder (Hamilton) apportionment of `total` across `needs`,
/// proportional to each need. Bankers' rounding is deliberately not used
/// here — spec 4.3 calls it out explicitly because it breaks
/// reconciliation determinism.
fn proportional_largest_remainder(total: i64, needs: &[i64]) -> Vec<i64> {
    let need_sum: i64 = needs.iter().sum();
    if need_sum == 0 || total == 0 {
        return vec![0; needs.len()];
    }

    let mut shares = Vec::with_capacity(needs.len());
    let mut remainders = Vec::with_capacity(needs.len());
    let mut allocated = 0i64;

    for &need in needs {
        let numerator = i128::from(total) * i128::from(need);
        let base = (numerator / i128::from(need_sum)) as i64;
        let remainder = numerator - i128::from(base) * i128::from(need_sum);
        shares.push(base);
        remainders.push(remainder);
        allocated += base;
    }

    let mut leftover = total - allocated;
    let mut order: Vec<usize> = (0..needs.len()).collect();
    order.sort_by(|&a, &b| remainders[b].cmp(&remainders[a]));

    for &idx in &order {
        if leftover == 0 {
            break;
        }
        shares[idx] += 1;
        leftover -= 1;
    }

    shares
}

/// Apply `amount` against `outstanding` following `order`. The sum
/// invariant (spec 8, "allocation sum") holds by construction: every cent
/// either lands in a named bucket or in suspense.
#[must_use]
pub fn allocate(amount: Money, outstanding: Outstanding, order: &WaterfallOrder) -> Allocation {
    let mut remaining = amount.as_cents();
    let mut alloc = Allocation::default();

    for group in order {
        if remaining <= 0 {
            break;
        }

        if group.len() == 1 {
            let bucket = group[0];
            let need = outstanding.need(bucket).as_cents();
            let take = remaining.min(need);
            add_to_bucket(&mut alloc, bucket, take);
            remaining -= take;
            continue;
        }

        let needs: Vec<i64> = group.iter().map(|b| outstanding.need(*b).as_cents()).collect();
        let total_need: i64 = needs.iter().sum();
        let to_group = remaining.min(total_need);
        if to_group == 0 {
            continue;
        }
        let shares = proportional_largest_remainder(to_group, &needs);
        for (bucket, share) in group.iter().zip(shares) {
            add_to_bucket(&mut alloc, *bucket, share);
        }
        remaining -= to_group;
    }

    alloc.suspense = remaining;
    alloc
}
