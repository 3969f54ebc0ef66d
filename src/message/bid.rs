//! Deterministic bid selection.
//!
//! Bids are ordered by their best (lowest-cost) offer. Ties are broken by
//! position in the input slice, which the manager keeps in arrival order, so
//! the first received bid wins. Duplicate bids from the same contractor never
//! reach this slice; the manager drops them on arrival.

use super::{Bid, Message, Offer};

impl Bid {
    /// Lowest-cost offer and its index; the first one on equal cost.
    pub fn best_offer(&self) -> Option<(usize, &Offer)> {
        self.offers
            .iter()
            .enumerate()
            .fold(None, |best, (idx, offer)| match best {
                Some((_, b)) if b.cost <= offer.cost => best,
                _ => Some((idx, offer)),
            })
    }

    /// Cost of the best offer
    pub fn best_cost(&self) -> Option<i64> {
        self.best_offer().map(|(_, offer)| offer.cost)
    }
}

/// Pick up to `number` winning bid messages, best first.
///
/// Messages that are not bids, or bids without offers, are skipped.
pub fn pick_best(bids: &[Message], number: usize) -> Vec<&Message> {
    let mut ranked: Vec<(i64, &Message)> = bids
        .iter()
        .filter_map(|msg| msg.as_bid().and_then(Bid::best_cost).map(|cost| (cost, msg)))
        .collect();
    // stable: equal costs keep arrival order
    ranked.sort_by_key(|(cost, _)| *cost);
    ranked.into_iter().take(number).map(|(_, msg)| msg).collect()
}
