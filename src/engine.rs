//! Price/time-priority matching engine.
//!
//! Two price-ordered books (`BTreeMap<price, VecDeque<Order>>` — ascending
//! for asks, `Reverse`-keyed for descending bids) plus an id index. The
//! engine is the exclusive owner of live orders; nothing outside this
//! module mutates a resting order. An ordered map per side keeps the book
//! invariants (price priority, then arrival order within a level) true by
//! construction, with no periodic re-sort needed as the top of book moves.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::EngineError;

pub const SIDE_BUY: u8 = 1;
pub const SIDE_SELL: u8 = 2;

pub const ORDER_TYPE_LIMIT: u8 = 1;
pub const ORDER_TYPE_MARKET: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn wire_code(self) -> u8 {
        match self {
            Side::Buy => SIDE_BUY,
            Side::Sell => SIDE_SELL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Modified,
}

/// An order resting in or passing through the book. Immutable identity
/// fields plus mutable residual quantity/status.
#[derive(Debug, Clone)]
pub struct Order {
    pub server_order_id: u64,
    pub client_id: u64,
    pub side: Side,
    pub order_type: OrderType,
    pub instrument_id: u32,
    pub submit_time: u64,
    pub time_in_force: u8,
    pub good_till_date: u64,
    pub qty: i64,
    pub price: i64,
    pub status: OrderStatus,
}

/// Result of validating an inbound NEW_ORDER message. Invalid requests
/// never reach the book.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_id: u64,
    pub side: Side,
    pub order_type: OrderType,
    pub instrument_id: u32,
    pub qty: i64,
    pub price: i64,
    pub time_in_force: u8,
    pub good_till_date: u64,
    pub valid: bool,
}

impl OrderRequest {
    pub fn validate(
        client_id: u64,
        side: Side,
        order_type: OrderType,
        instrument_id: u32,
        qty: i64,
        price: i64,
        time_in_force: u8,
        good_till_date: u64,
    ) -> Self {
        let valid = match order_type {
            OrderType::Limit => price > 0 && qty > 0,
            OrderType::Market => price == 0 && qty > 0,
        };
        OrderRequest {
            client_id,
            side,
            order_type,
            instrument_id,
            qty,
            price,
            time_in_force,
            good_till_date,
            valid,
        }
    }
}

/// One leg-pair fill produced during a match walk.
#[derive(Debug, Clone, Copy)]
pub struct TradeEvent {
    pub trade_id: u64,
    pub buyer_client_id: u64,
    pub buyer_order_id: u64,
    pub seller_client_id: u64,
    pub seller_order_id: u64,
    pub price: i64,
    pub qty: i64,
    pub timestamp: u64,
    pub instrument_id: u32,
}

/// Result of `Engine::process` for a single accepted order.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub order_id: u64,
    pub timestamp: u64,
    pub residual_qty: i64,
    pub status: OrderStatus,
    pub accepted_price: i64,
    pub trades: Vec<TradeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookUpdateKind {
    Add,
    Reduce,
}

/// One effect on a price level. Produced exactly once per effect: one ADD
/// when a resting order is inserted, one REDUCE per matched quantity, one
/// REDUCE on cancel/modify for the removed quantity. `level_created`/
/// `level_removed` mark the instant a price level itself is born or
/// exhausted, not just an add/reduce against it, so a log/telemetry
/// consumer can tell a level event from an ordinary size change.
#[derive(Debug, Clone, Copy)]
pub struct BookUpdate {
    pub price: i64,
    pub amount: i64,
    pub side: BookSide,
    pub kind: BookUpdateKind,
    pub level_created: bool,
    pub level_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyStatus {
    Accepted,
    NotFound,
    Invalid,
}

/// Result of `Engine::modify`.
#[derive(Debug, Clone)]
pub struct ModifyResult {
    pub old_order_id: u64,
    pub new_order_id: u64,
    pub requested_qty: i64,
    pub requested_price: i64,
    pub status: ModifyStatus,
    pub match_result: Option<MatchResult>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as u64
}

struct IndexEntry {
    side: Side,
    price: i64,
}

/// The matching engine. Owns `bids` (price-desc), `asks` (price-asc), the
/// id index, and the monotonic id/trade counters. All operations run
/// synchronously on the protocol handler's thread — no internal locking.
pub struct Engine {
    pub instrument_id: u32,
    bids: BTreeMap<Reverse<i64>, VecDeque<Order>>,
    asks: BTreeMap<i64, VecDeque<Order>>,
    index: HashMap<u64, IndexEntry>,
    next_order_id: u64,
    next_trade_id: u64,
}

impl Engine {
    pub fn new(instrument_id: u32) -> Self {
        Engine {
            instrument_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            next_order_id: 1,
            next_trade_id: 1,
        }
    }

    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.bids.keys().next().map(|Reverse(p)| *p)
    }

    pub fn best_ask(&self) -> Option<i64> {
        self.asks.keys().next().copied()
    }

    pub fn spread(&self) -> Option<i64> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn get_order(&self, order_id: u64) -> Option<&Order> {
        let entry = self.index.get(&order_id)?;
        let queue = match entry.side {
            Side::Buy => self.bids.get(&Reverse(entry.price))?,
            Side::Sell => self.asks.get(&entry.price)?,
        };
        queue.iter().find(|o| o.server_order_id == order_id)
    }

    fn alloc_order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    fn alloc_trade_id(&mut self) -> u64 {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        id
    }

    /// Core matching algorithm. Consumes the opposing side level by
    /// level, emitting trades and book updates in the order they occur.
    pub fn process(&mut self, req: OrderRequest) -> (MatchResult, Vec<BookUpdate>) {
        debug_assert!(req.valid, "caller must validate before calling process");

        let order_id = self.alloc_order_id();
        let original = req.qty;
        let mut remaining = req.qty;
        let timestamp = now_nanos();
        let mut trades = Vec::new();
        let mut updates = Vec::new();

        'outer: while remaining > 0 {
            let best_price = match req.side {
                Side::Buy => self.asks.keys().next().copied(),
                Side::Sell => self.bids.keys().next().map(|Reverse(p)| *p),
            };
            let Some(price) = best_price else { break };

            if req.order_type == OrderType::Limit {
                let passes = match req.side {
                    Side::Buy => req.price >= price,
                    Side::Sell => req.price <= price,
                };
                if !passes {
                    break;
                }
            }

            let level_empty;
            let updates_start = updates.len();
            {
                let queue = match req.side {
                    Side::Buy => self.asks.get_mut(&price).expect("level present"),
                    Side::Sell => self.bids.get_mut(&Reverse(price)).expect("level present"),
                };

                let mut idx = 0usize;
                let mut progress = false;
                while remaining > 0 && idx < queue.len() {
                    if queue[idx].client_id == req.client_id {
                        idx += 1;
                        continue;
                    }
                    progress = true;
                    let resting_qty = queue[idx].qty;
                    let m = remaining.min(resting_qty);

                    let (buyer_client, buyer_order, seller_client, seller_order) = match req.side
                    {
                        Side::Buy => (
                            req.client_id,
                            order_id,
                            queue[idx].client_id,
                            queue[idx].server_order_id,
                        ),
                        Side::Sell => (
                            queue[idx].client_id,
                            queue[idx].server_order_id,
                            req.client_id,
                            order_id,
                        ),
                    };
                    trades.push(TradeEvent {
                        trade_id: self.alloc_trade_id(),
                        buyer_client_id: buyer_client,
                        buyer_order_id: buyer_order,
                        seller_client_id: seller_client,
                        seller_order_id: seller_order,
                        price,
                        qty: m,
                        timestamp,
                        instrument_id: self.instrument_id,
                    });

                    remaining -= m;
                    queue[idx].qty -= m;

                    let resting_side = match req.side {
                        Side::Buy => BookSide::Ask,
                        Side::Sell => BookSide::Bid,
                    };
                    updates.push(BookUpdate {
                        price,
                        amount: m,
                        side: resting_side,
                        kind: BookUpdateKind::Reduce,
                        level_created: false,
                        level_removed: false,
                    });

                    if queue[idx].qty == 0 {
                        let removed = queue.remove(idx).expect("idx in bounds");
                        self.index.remove(&removed.server_order_id);
                        // don't advance idx: remove shifted the tail down
                    } else {
                        idx += 1;
                    }
                }

                level_empty = queue.is_empty();
                if level_empty {
                    if let Some(last) = updates[updates_start..].last_mut() {
                        last.level_removed = true;
                    }
                }

                if !progress {
                    level_empty_cleanup(req.side, &mut self.bids, &mut self.asks, price, level_empty);
                    break 'outer;
                }
            }

            level_empty_cleanup(req.side, &mut self.bids, &mut self.asks, price, level_empty);
        }

        let status = match req.order_type {
            OrderType::Limit => {
                if remaining == 0 {
                    OrderStatus::Filled
                } else {
                    let status = if remaining < original {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::New
                    };
                    let level_created = match req.side {
                        Side::Buy => !self.bids.contains_key(&Reverse(req.price)),
                        Side::Sell => !self.asks.contains_key(&req.price),
                    };
                    let order = Order {
                        server_order_id: order_id,
                        client_id: req.client_id,
                        side: req.side,
                        order_type: req.order_type,
                        instrument_id: req.instrument_id,
                        submit_time: timestamp,
                        time_in_force: req.time_in_force,
                        good_till_date: req.good_till_date,
                        qty: remaining,
                        price: req.price,
                        status,
                    };
                    self.insert_resting(order);
                    updates.push(BookUpdate {
                        price: req.price,
                        amount: remaining,
                        side: match req.side {
                            Side::Buy => BookSide::Bid,
                            Side::Sell => BookSide::Ask,
                        },
                        kind: BookUpdateKind::Add,
                        level_created,
                        level_removed: false,
                    });
                    status
                }
            }
            OrderType::Market => {
                if remaining == 0 {
                    OrderStatus::Filled
                } else if remaining < original {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Cancelled
                }
            }
        };

        let result = MatchResult {
            order_id,
            timestamp,
            residual_qty: remaining,
            status,
            accepted_price: req.price,
            trades,
        };
        (result, updates)
    }

    fn insert_resting(&mut self, order: Order) {
        let id = order.server_order_id;
        let side = order.side;
        let price = order.price;
        match side {
            Side::Buy => self.bids.entry(Reverse(price)).or_default().push_back(order),
            Side::Sell => self.asks.entry(price).or_default().push_back(order),
        }
        self.index.insert(id, IndexEntry { side, price });
    }

    /// Cancel an order owned by `client_id`. Returns the REDUCE book
    /// update for the removed quantity, or an `EngineError` if the order
    /// doesn't exist or isn't owned by `client_id`.
    pub fn cancel(&mut self, client_id: u64, order_id: u64) -> Result<BookUpdate, EngineError> {
        let entry = self
            .index
            .get(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;
        let side = entry.side;
        let price = entry.price;

        let queue = match side {
            Side::Buy => self.bids.get_mut(&Reverse(price)),
            Side::Sell => self.asks.get_mut(&price),
        }
        .expect("id index and book must agree");

        let pos = queue
            .iter()
            .position(|o| o.server_order_id == order_id)
            .expect("id index and queue must agree");

        if queue[pos].client_id != client_id {
            return Err(EngineError::NotOwner {
                client: client_id,
                order: order_id,
            });
        }

        let removed = queue.remove(pos).expect("pos in bounds");
        self.index.remove(&order_id);
        let is_empty = queue.is_empty();

        let book_side = match side {
            Side::Buy => BookSide::Bid,
            Side::Sell => BookSide::Ask,
        };
        level_empty_cleanup(side, &mut self.bids, &mut self.asks, price, is_empty);

        Ok(BookUpdate {
            price,
            amount: removed.qty,
            side: book_side,
            kind: BookUpdateKind::Reduce,
            level_created: false,
            level_removed: is_empty,
        })
    }

    /// Cancels every resting order owned by `client_id`. Used by the
    /// `cancel_on_disconnect` policy toggle when a session closes.
    pub fn cancel_all_for_client(&mut self, client_id: u64) -> Vec<BookUpdate> {
        let order_ids: Vec<u64> = self
            .bids
            .values()
            .chain(self.asks.values())
            .flat_map(|queue| queue.iter())
            .filter(|o| o.client_id == client_id)
            .map(|o| o.server_order_id)
            .collect();

        order_ids
            .into_iter()
            .filter_map(|id| self.cancel(client_id, id).ok())
            .collect()
    }

    /// Amend an existing order's qty/price. A same-price quantity
    /// decrease adjusts in place, preserving time priority. Any price
    /// change, or a quantity increase, cancels the order and resubmits a
    /// fresh order under a new id — which may cross immediately.
    pub fn modify(
        &mut self,
        client_id: u64,
        order_id: u64,
        new_qty: i64,
        new_price: i64,
    ) -> (ModifyResult, Vec<BookUpdate>) {
        let Some(entry_side_price) = self.index.get(&order_id).map(|e| (e.side, e.price)) else {
            return (
                ModifyResult {
                    old_order_id: order_id,
                    new_order_id: order_id,
                    requested_qty: new_qty,
                    requested_price: new_price,
                    status: ModifyStatus::NotFound,
                    match_result: None,
                },
                vec![],
            );
        };
        let (side, old_price) = entry_side_price;

        if new_qty <= 0 || new_price <= 0 {
            return (
                ModifyResult {
                    old_order_id: order_id,
                    new_order_id: order_id,
                    requested_qty: new_qty,
                    requested_price: new_price,
                    status: ModifyStatus::Invalid,
                    match_result: None,
                },
                vec![],
            );
        }

        let queue = match side {
            Side::Buy => self.bids.get_mut(&Reverse(old_price)),
            Side::Sell => self.asks.get_mut(&old_price),
        }
        .expect("id index and book must agree");
        let pos = queue
            .iter()
            .position(|o| o.server_order_id == order_id)
            .expect("id index and queue must agree");

        if queue[pos].client_id != client_id {
            return (
                ModifyResult {
                    old_order_id: order_id,
                    new_order_id: order_id,
                    requested_qty: new_qty,
                    requested_price: new_price,
                    status: ModifyStatus::Invalid,
                    match_result: None,
                },
                vec![],
            );
        }

        let old_qty = queue[pos].qty;

        if new_price == old_price && new_qty == old_qty {
            return (
                ModifyResult {
                    old_order_id: order_id,
                    new_order_id: order_id,
                    requested_qty: new_qty,
                    requested_price: new_price,
                    status: ModifyStatus::Accepted,
                    match_result: None,
                },
                vec![],
            );
        }

        if new_price == old_price && new_qty < old_qty {
            let delta = old_qty - new_qty;
            queue[pos].qty = new_qty;
            queue[pos].status = OrderStatus::Modified;

            let book_side = match side {
                Side::Buy => BookSide::Bid,
                Side::Sell => BookSide::Ask,
            };
            let update = BookUpdate {
                price: old_price,
                amount: delta,
                side: book_side,
                kind: BookUpdateKind::Reduce,
                level_created: false,
                level_removed: false,
            };
            return (
                ModifyResult {
                    old_order_id: order_id,
                    new_order_id: order_id,
                    requested_qty: new_qty,
                    requested_price: new_price,
                    status: ModifyStatus::Accepted,
                    match_result: None,
                },
                vec![update],
            );
        }

        // Quantity increase or any price change: cancel + resubmit under a new id.
        let removed = queue.remove(pos).expect("pos in bounds");
        self.index.remove(&order_id);
        let queue_empty = queue.is_empty();
        let mut updates = vec![BookUpdate {
            price: old_price,
            amount: old_qty,
            side: match side {
                Side::Buy => BookSide::Bid,
                Side::Sell => BookSide::Ask,
            },
            kind: BookUpdateKind::Reduce,
            level_created: false,
            level_removed: queue_empty,
        }];
        level_empty_cleanup(side, &mut self.bids, &mut self.asks, old_price, queue_empty);

        let req = OrderRequest {
            client_id,
            side,
            order_type: OrderType::Limit,
            instrument_id: removed.instrument_id,
            qty: new_qty,
            price: new_price,
            time_in_force: removed.time_in_force,
            good_till_date: removed.good_till_date,
            valid: true,
        };
        let (match_result, mut process_updates) = self.process(req);
        updates.append(&mut process_updates);

        (
            ModifyResult {
                old_order_id: order_id,
                new_order_id: match_result.order_id,
                requested_qty: new_qty,
                requested_price: new_price,
                status: ModifyStatus::Accepted,
                match_result: Some(match_result),
            },
            updates,
        )
    }
}

fn level_empty_cleanup(
    side: Side,
    bids: &mut BTreeMap<Reverse<i64>, VecDeque<Order>>,
    asks: &mut BTreeMap<i64, VecDeque<Order>>,
    price: i64,
    empty: bool,
) {
    if !empty {
        return;
    }
    match side {
        Side::Buy => {
            bids.remove(&Reverse(price));
        }
        Side::Sell => {
            asks.remove(&price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(engine: &Engine, client: u64, side: Side, qty: i64, price: i64) -> OrderRequest {
        OrderRequest::validate(client, side, OrderType::Limit, engine.instrument_id, qty, price, 0, 0)
    }

    fn market(engine: &Engine, client: u64, side: Side, qty: i64) -> OrderRequest {
        OrderRequest::validate(client, side, OrderType::Market, engine.instrument_id, qty, 0, 0, 0)
    }

    #[test]
    fn perfect_fill() {
        let mut engine = Engine::new(1);
        let (buy_result, _) = engine.process(limit(&engine, 1, Side::Buy, 100, 2000));
        assert_eq!(buy_result.status, OrderStatus::New);
        assert!(buy_result.trades.is_empty());

        let (sell_result, _) = engine.process(limit(&engine, 2, Side::Sell, 100, 2000));
        assert_eq!(sell_result.status, OrderStatus::Filled);
        assert_eq!(sell_result.trades.len(), 1);
        assert_eq!(sell_result.trades[0].qty, 100);
        assert_eq!(sell_result.trades[0].price, 2000);
        assert_eq!(engine.best_bid(), None);
        assert_eq!(engine.best_ask(), None);
        assert_eq!(engine.spread(), None);
    }

    #[test]
    fn price_crossing_limit_walks_levels() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 10, Side::Sell, 50, 100));
        engine.process(limit(&engine, 11, Side::Sell, 50, 101));
        engine.process(limit(&engine, 12, Side::Sell, 50, 102));

        let (result, _) = engine.process(limit(&engine, 1, Side::Buy, 80, 101));
        assert_eq!(result.trades.len(), 2);
        assert_eq!((result.trades[0].price, result.trades[0].qty), (100, 50));
        assert_eq!((result.trades[1].price, result.trades[1].qty), (101, 30));
        assert_eq!(result.residual_qty, 0);
        assert_eq!(engine.best_ask(), Some(101));
    }

    #[test]
    fn partial_fill_leaves_residual() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        let (result, _) = engine.process(limit(&engine, 2, Side::Sell, 60, 200));
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].qty, 60);
        let resting = engine.get_order(1).expect("order should rest");
        assert_eq!(resting.qty, 40);
        assert_eq!(resting.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn market_into_empty_book_is_cancelled() {
        let mut engine = Engine::new(1);
        let (result, updates) = engine.process(market(&engine, 1, Side::Buy, 100));
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert!(result.trades.is_empty());
        assert!(updates.is_empty());
        assert_eq!(engine.best_bid(), None);
    }

    #[test]
    fn self_trade_is_skipped_and_can_lock_book() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 7, Side::Buy, 100, 200));
        let (result, _) = engine.process(limit(&engine, 7, Side::Sell, 100, 200));
        assert!(result.trades.is_empty());
        assert_eq!(result.status, OrderStatus::New);
        // Locked book: resting sell at 200 == resting buy at 200.
        assert_eq!(engine.best_bid(), Some(200));
        assert_eq!(engine.best_ask(), Some(200));
    }

    #[test]
    fn modify_with_price_change_can_cross() {
        let mut engine = Engine::new(1);
        let (buy, _) = engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        engine.process(limit(&engine, 2, Side::Sell, 100, 201));

        let (modify_result, _) = engine.modify(1, buy.order_id, 100, 201);
        assert_eq!(modify_result.status, ModifyStatus::Accepted);
        assert_ne!(modify_result.new_order_id, modify_result.old_order_id);
        let match_result = modify_result.match_result.expect("should have matched");
        assert_eq!(match_result.trades.len(), 1);
        assert_eq!(match_result.trades[0].qty, 100);
        assert_eq!(match_result.trades[0].price, 201);
        assert_eq!(engine.best_bid(), None);
        assert_eq!(engine.best_ask(), None);
    }

    #[test]
    fn modify_same_qty_and_price_is_noop() {
        let mut engine = Engine::new(1);
        let (buy, _) = engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        let (modify_result, updates) = engine.modify(1, buy.order_id, 100, 200);
        assert_eq!(modify_result.status, ModifyStatus::Accepted);
        assert_eq!(modify_result.new_order_id, buy.order_id);
        assert!(updates.is_empty());
    }

    #[test]
    fn modify_quantity_reduction_preserves_id_and_priority() {
        let mut engine = Engine::new(1);
        let (buy, _) = engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        let (modify_result, updates) = engine.modify(1, buy.order_id, 40, 200);
        assert_eq!(modify_result.new_order_id, buy.order_id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].amount, 60);
        assert_eq!(engine.get_order(buy.order_id).unwrap().qty, 40);
    }

    #[test]
    fn cancel_all_for_client_removes_every_resting_order() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 1, Side::Buy, 10, 100));
        engine.process(limit(&engine, 1, Side::Sell, 10, 200));
        engine.process(limit(&engine, 2, Side::Buy, 5, 90));

        let updates = engine.cancel_all_for_client(1);
        assert_eq!(updates.len(), 2);
        assert_eq!(engine.best_ask(), None);
        assert_eq!(engine.best_bid(), Some(90));
    }

    #[test]
    fn cancel_unknown_order_errors() {
        let mut engine = Engine::new(1);
        assert!(matches!(
            engine.cancel(1, 999),
            Err(EngineError::UnknownOrder(999))
        ));
    }

    #[test]
    fn cancel_not_owned_errors() {
        let mut engine = Engine::new(1);
        let (buy, _) = engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        assert!(matches!(
            engine.cancel(2, buy.order_id),
            Err(EngineError::NotOwner { .. })
        ));
    }

    #[test]
    fn book_invariant_no_locked_book_normally() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 1, Side::Buy, 10, 100));
        engine.process(limit(&engine, 2, Side::Sell, 10, 110));
        assert!(engine.best_bid().unwrap() < engine.best_ask().unwrap());
    }

    #[test]
    fn conservation_holds_across_partial_fill() {
        let mut engine = Engine::new(1);
        engine.process(limit(&engine, 1, Side::Buy, 100, 200));
        let (result, _) = engine.process(limit(&engine, 2, Side::Sell, 60, 200));
        let traded: i64 = result.trades.iter().map(|t| t.qty).sum();
        assert_eq!(60, result.residual_qty + traded);
    }
}
