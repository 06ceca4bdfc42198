//! Binary Cross-Matching Engine
//!
//! Matches an incoming order against a four-sided book under price-time
//! priority. Liquidity comes from two streams merged by effective price:
//! the taker's own side, and the complementary side at `1 - price` (a
//! cross-match, which mints a YES/NO pair instead of moving shares).
//!
//! Matching is purely computational: it mutates the in-memory book and
//! yields trades; durable writes belong to the caller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    OrderAction, OrderSide, OrderStatus, OrderType, SettlementStatus, Trade, TradeType,
};
use crate::services::orderbook::{BookSide, OrderBook};

/// The taker as seen by the engine. `price` is absent for market orders.
#[derive(Debug, Clone)]
pub struct IncomingOrder {
    pub id: Uuid,
    pub market_id: String,
    pub user_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Maker-side bookkeeping for one fill, aligned 1:1 with
/// `MatchOutcome::trades`.
#[derive(Debug, Clone)]
pub struct MakerFill {
    pub order_id: Uuid,
    pub user_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    /// The maker's own limit price; what the maker pays or receives.
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_after: Decimal,
    pub status_after: OrderStatus,
    /// What the taker pays or receives per share on the taker's side.
    pub taker_unit_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub taker_status: OrderStatus,
    pub filled_quantity: Decimal,
    /// True when the remainder should be placed on the book.
    pub rests: bool,
    pub trades: Vec<Trade>,
    pub fills: Vec<MakerFill>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    order_id: Uuid,
    effective: Decimal,
    created_at: DateTime<Utc>,
    cross: bool,
}

/// (same-side liquidity, cross-side liquidity) for a taker. Only buyers
/// source cross-side liquidity: a buy-yes against a resting buy-no mints a
/// pair from both buyers' collateral. Two sellers crossing would be a pair
/// merge, which is an explicit position operation, not a trade.
fn liquidity_sides(side: OrderSide, action: OrderAction) -> (BookSide, Option<BookSide>) {
    match (side, action) {
        (OrderSide::Yes, OrderAction::Buy) => (BookSide::YesAsk, Some(BookSide::NoBid)),
        (OrderSide::No, OrderAction::Buy) => (BookSide::NoAsk, Some(BookSide::YesBid)),
        (OrderSide::Yes, OrderAction::Sell) => (BookSide::YesBid, None),
        (OrderSide::No, OrderAction::Sell) => (BookSide::NoBid, None),
    }
}

fn collect_candidates(book: &OrderBook, taker: &IncomingOrder) -> Vec<Candidate> {
    let (same_side, cross_side) = liquidity_sides(taker.side, taker.action);

    let cross: Vec<Candidate> = cross_side
        .map(|side| {
            book.priority_scan(side)
                .into_iter()
                .map(|(order_id, price, created_at)| Candidate {
                    order_id,
                    effective: Decimal::ONE - price,
                    created_at,
                    cross: true,
                })
                .collect()
        })
        .unwrap_or_default();

    let mut candidates: Vec<Candidate> = book
        .priority_scan(same_side)
        .into_iter()
        .map(|(order_id, price, created_at)| Candidate {
            order_id,
            effective: price,
            created_at,
            cross: false,
        })
        .chain(cross)
        .collect();

    // Buys want the cheapest effective price first, sells the richest;
    // FIFO breaks ties either way.
    match taker.action {
        OrderAction::Buy => {
            candidates.sort_by(|a, b| (a.effective, a.created_at).cmp(&(b.effective, b.created_at)))
        }
        OrderAction::Sell => candidates
            .sort_by(|a, b| (b.effective, a.created_at).cmp(&(a.effective, b.created_at))),
    }
    candidates
}

/// Whether `effective` is still acceptable for the taker's limit.
fn within_limit(action: OrderAction, limit: Decimal, effective: Decimal) -> bool {
    match action {
        OrderAction::Buy => effective <= limit,
        OrderAction::Sell => effective >= limit,
    }
}

pub fn match_order(book: &mut OrderBook, taker: &IncomingOrder) -> MatchOutcome {
    let mut trades = Vec::new();
    let mut fills = Vec::new();
    let mut filled = Decimal::ZERO;
    let now = Utc::now();

    for candidate in collect_candidates(book, taker) {
        let remaining = taker.quantity - filled;
        if remaining <= Decimal::ZERO {
            break;
        }

        // The sorted walk short-circuits once price leaves the limit.
        if let Some(limit) = taker.price {
            if !within_limit(taker.action, limit, candidate.effective) {
                break;
            }
        }

        let Some(maker) = book.get_order(candidate.order_id) else {
            continue;
        };
        if maker.user_id == taker.user_id {
            continue;
        }

        let quantity = remaining.min(maker.remaining());
        debug_assert!(quantity > Decimal::ZERO);

        let maker = maker.clone();
        let filled_after = maker.filled_quantity + quantity;
        let status_after = if filled_after >= maker.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        if status_after == OrderStatus::Filled {
            book.remove_order(maker.id);
        } else {
            book.update_order(maker.id, filled_after);
        }

        trades.push(build_trade(taker, &maker, candidate, quantity, now));
        fills.push(MakerFill {
            order_id: maker.id,
            user_id: maker.user_id.clone(),
            side: maker.side,
            action: maker.action,
            price: maker.price,
            quantity,
            filled_after,
            status_after,
            taker_unit_price: candidate.effective,
        });
        filled += quantity;
    }

    let remaining = taker.quantity - filled;
    let (taker_status, rests) = if remaining <= Decimal::ZERO {
        (OrderStatus::Filled, false)
    } else if taker.order_type == OrderType::Limit {
        if filled > Decimal::ZERO {
            (OrderStatus::Partial, true)
        } else {
            (OrderStatus::Open, true)
        }
    } else if filled > Decimal::ZERO {
        // Market remainder never rests.
        (OrderStatus::Partial, false)
    } else {
        (OrderStatus::Rejected, false)
    };

    MatchOutcome {
        taker_status,
        filled_quantity: filled,
        rests,
        trades,
        fills,
    }
}

/// Publish a normalised trade. Same-side fills keep the traded side and the
/// maker's price. Cross-matches are recorded YES-normalised: buyer is the
/// YES-buyer, seller the NO-buyer, price the YES side's per-share cost.
fn build_trade(
    taker: &IncomingOrder,
    maker: &crate::services::orderbook::BookOrder,
    candidate: Candidate,
    quantity: Decimal,
    now: DateTime<Utc>,
) -> Trade {
    let (side, price, trade_type, buyer, buyer_order, seller, seller_order) = if candidate.cross {
        let yes_price = match taker.side {
            OrderSide::Yes => candidate.effective,
            OrderSide::No => Decimal::ONE - candidate.effective,
        };
        let (yes_buyer, yes_order, no_buyer, no_order) = match taker.side {
            OrderSide::Yes => (&taker.user_id, taker.id, &maker.user_id, maker.id),
            OrderSide::No => (&maker.user_id, maker.id, &taker.user_id, taker.id),
        };
        (
            OrderSide::Yes,
            yes_price,
            TradeType::ShareCreation,
            yes_buyer.clone(),
            yes_order,
            no_buyer.clone(),
            no_order,
        )
    } else {
        let (buyer, buyer_order, seller, seller_order) = match taker.action {
            OrderAction::Buy => (&taker.user_id, taker.id, &maker.user_id, maker.id),
            OrderAction::Sell => (&maker.user_id, maker.id, &taker.user_id, taker.id),
        };
        (
            taker.side,
            candidate.effective,
            TradeType::ShareTrade,
            buyer.clone(),
            buyer_order,
            seller.clone(),
            seller_order,
        )
    };

    debug_assert_ne!(buyer, seller);

    Trade {
        id: Uuid::new_v4(),
        market_id: taker.market_id.clone(),
        buyer_id: buyer,
        seller_id: seller,
        side,
        price,
        quantity,
        buyer_order_id: buyer_order,
        seller_order_id: seller_order,
        trade_type,
        settlement_status: SettlementStatus::Pending,
        settlement_id: None,
        created_at: now,
        settled_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orderbook::BookOrder;
    use rust_decimal_macros::dec;

    fn resting(
        user: &str,
        side: OrderSide,
        action: OrderAction,
        price: Decimal,
        qty: Decimal,
    ) -> BookOrder {
        BookOrder {
            id: Uuid::new_v4(),
            market_id: "mkt-1".into(),
            user_id: user.into(),
            side,
            action,
            order_type: OrderType::Limit,
            price,
            quantity: qty,
            filled_quantity: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    fn incoming(
        user: &str,
        side: OrderSide,
        action: OrderAction,
        price: Option<Decimal>,
        qty: Decimal,
    ) -> IncomingOrder {
        IncomingOrder {
            id: Uuid::new_v4(),
            market_id: "mkt-1".into(),
            user_id: user.into(),
            side,
            action,
            order_type: if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            price,
            quantity: qty,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_same_side_match_with_price_improvement() {
        // Alice rests buy yes @ 0.60 x10; Bob sells yes @ 0.55 x6.
        let mut book = OrderBook::new("mkt-1");
        let alice = resting("alice", OrderSide::Yes, OrderAction::Buy, dec!(0.60), dec!(10));
        let alice_id = alice.id;
        book.add_order(alice).unwrap();

        let bob = incoming("bob", OrderSide::Yes, OrderAction::Sell, Some(dec!(0.55)), dec!(6));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.taker_status, OrderStatus::Filled);
        assert_eq!(outcome.trades.len(), 1);
        let trade = &outcome.trades[0];
        assert_eq!(trade.side, OrderSide::Yes);
        assert_eq!(trade.price, dec!(0.60));
        assert_eq!(trade.quantity, dec!(6));
        assert_eq!(trade.buyer_id, "alice");
        assert_eq!(trade.seller_id, "bob");
        assert_eq!(trade.trade_type, TradeType::ShareTrade);

        // Alice is partially consumed and still on the book
        assert_eq!(book.get_order(alice_id).unwrap().remaining(), dec!(4));
        assert_eq!(outcome.fills[0].status_after, OrderStatus::Partial);
    }

    #[test]
    fn test_cross_match_creates_shares() {
        // Alice rests buy yes @ 0.70 x5; Bob buys no @ 0.30 x5.
        // 0.70 + 0.30 >= 1, so a pair is minted.
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("alice", OrderSide::Yes, OrderAction::Buy, dec!(0.70), dec!(5)))
            .unwrap();

        let bob = incoming("bob", OrderSide::No, OrderAction::Buy, Some(dec!(0.30)), dec!(5));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.taker_status, OrderStatus::Filled);
        let trade = &outcome.trades[0];
        assert_eq!(trade.trade_type, TradeType::ShareCreation);
        assert_eq!(trade.side, OrderSide::Yes);
        assert_eq!(trade.price, dec!(0.70));
        assert_eq!(trade.buyer_id, "alice");
        assert_eq!(trade.seller_id, "bob");
        assert_eq!(trade.quantity, dec!(5));
        assert_eq!(book.order_count(), 0);
    }

    #[test]
    fn test_cross_match_price_improvement_accrues_to_taker() {
        // Bob rests buy no @ 0.40; Alice takes with buy yes @ 0.70.
        // Alice pays effective 1 - 0.40 = 0.60, Bob pays his limit 0.40.
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("bob", OrderSide::No, OrderAction::Buy, dec!(0.40), dec!(5)))
            .unwrap();

        let alice = incoming("alice", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.70)), dec!(5));
        let outcome = match_order(&mut book, &alice);

        let trade = &outcome.trades[0];
        assert_eq!(trade.price, dec!(0.60));
        assert_eq!(trade.buyer_id, "alice");
        assert_eq!(trade.seller_id, "bob");
        // Maker pays exactly his limit; pair collateral sums to 1.0
        assert_eq!(outcome.fills[0].price, dec!(0.40));
        assert_eq!(outcome.fills[0].taker_unit_price, dec!(0.60));
        assert_eq!(trade.price + outcome.fills[0].price, dec!(1.00));
    }

    #[test]
    fn test_self_match_prevented() {
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("alice", OrderSide::Yes, OrderAction::Sell, dec!(0.60), dec!(10)))
            .unwrap();

        let alice = incoming("alice", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.60)), dec!(5));
        let outcome = match_order(&mut book, &alice);

        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.taker_status, OrderStatus::Open);
        assert!(outcome.rests);
    }

    #[test]
    fn test_partial_fill_rests_remainder() {
        // Book: sell yes @ 0.50 x3. Bob buys yes @ 0.55 x7.
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("carol", OrderSide::Yes, OrderAction::Sell, dec!(0.50), dec!(3)))
            .unwrap();

        let bob = incoming("bob", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.55)), dec!(7));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.taker_status, OrderStatus::Partial);
        assert!(outcome.rests);
        assert_eq!(outcome.filled_quantity, dec!(3));
        assert_eq!(outcome.trades[0].price, dec!(0.50));
    }

    #[test]
    fn test_market_order_against_empty_book_rejected() {
        let mut book = OrderBook::new("mkt-1");
        let bob = incoming("bob", OrderSide::Yes, OrderAction::Buy, None, dec!(5));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.taker_status, OrderStatus::Rejected);
        assert!(!outcome.rests);
    }

    #[test]
    fn test_market_order_partial_never_rests() {
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("carol", OrderSide::Yes, OrderAction::Sell, dec!(0.50), dec!(3)))
            .unwrap();

        let bob = incoming("bob", OrderSide::Yes, OrderAction::Buy, None, dec!(10));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.taker_status, OrderStatus::Partial);
        assert!(!outcome.rests);
        assert_eq!(outcome.filled_quantity, dec!(3));
    }

    #[test]
    fn test_price_time_priority_across_streams() {
        // Same effective price 0.50 from a yes-ask and a no-bid; the older
        // maker fills first regardless of which stream it came from.
        let mut book = OrderBook::new("mkt-1");
        let mut older = resting("carol", OrderSide::No, OrderAction::Buy, dec!(0.50), dec!(4));
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let older_id = older.id;
        book.add_order(older).unwrap();
        let newer = resting("dave", OrderSide::Yes, OrderAction::Sell, dec!(0.50), dec!(4));
        book.add_order(newer).unwrap();

        let bob = incoming("bob", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.50)), dec!(4));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.fills[0].order_id, older_id);
        assert_eq!(outcome.trades[0].trade_type, TradeType::ShareCreation);
    }

    #[test]
    fn test_limit_walk_stops_at_limit() {
        let mut book = OrderBook::new("mkt-1");
        book.add_order(resting("carol", OrderSide::Yes, OrderAction::Sell, dec!(0.50), dec!(2)))
            .unwrap();
        book.add_order(resting("dave", OrderSide::Yes, OrderAction::Sell, dec!(0.65), dec!(2)))
            .unwrap();

        let bob = incoming("bob", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.55)), dec!(4));
        let outcome = match_order(&mut book, &bob);

        assert_eq!(outcome.filled_quantity, dec!(2));
        assert_eq!(outcome.taker_status, OrderStatus::Partial);
        // The 0.65 ask was never touched
        assert_eq!(book.order_count(), 1);
    }

    #[test]
    fn test_quantity_conservation() {
        let mut book = OrderBook::new("mkt-1");
        for (user, price, qty) in [("a", dec!(0.50), dec!(3)), ("b", dec!(0.52), dec!(4))] {
            book.add_order(resting(user, OrderSide::Yes, OrderAction::Sell, price, qty)).unwrap();
        }

        let taker = incoming("t", OrderSide::Yes, OrderAction::Buy, Some(dec!(0.55)), dec!(5));
        let outcome = match_order(&mut book, &taker);

        let traded: Decimal = outcome.trades.iter().map(|t| t.quantity).sum();
        let maker_filled: Decimal = outcome.fills.iter().map(|f| f.quantity).sum();
        assert_eq!(traded, outcome.filled_quantity);
        assert_eq!(traded, maker_filled);
        // filled never exceeds quantity
        assert!(outcome.filled_quantity <= taker.quantity);
    }
}
