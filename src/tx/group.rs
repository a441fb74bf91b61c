//! Grouped order builder
//!
//! Composes related order legs into one atomic transaction signed with a
//! single nonce, or independent packages into a batch.
//!
//! Leg rules enforced on every group:
//! - only the first leg may carry a client order index
//! - conditional legs (stop-loss/take-profit) carry zero size and reduce-only
//! - in trigger modes, conditional legs take the side opposite the primary
//! - all legs trade the same market

use crate::error::{ClientError, ClientResult};
use crate::signer::{OrderParams, OrderType, SignedTransactionPackage, TimeInForce, DEFAULT_EXPIRY};
use crate::stream::MAX_BATCH_SIZE;

use tracing::debug;

/// Relationship between the legs of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    /// Primary fill places one conditional leg
    OneTriggersOther,
    /// Two conditional legs; a fill of either cancels the other
    OneCancelsOther,
    /// Primary fill places a stop-loss and take-profit that cancel each other
    OneTriggersOco,
}

impl GroupingMode {
    pub fn code(self) -> u8 {
        match self {
            GroupingMode::OneTriggersOther => 1,
            GroupingMode::OneCancelsOther => 2,
            GroupingMode::OneTriggersOco => 3,
        }
    }

    pub fn leg_count(self) -> usize {
        match self {
            GroupingMode::OneTriggersOther | GroupingMode::OneCancelsOther => 2,
            GroupingMode::OneTriggersOco => 3,
        }
    }

    /// Modes whose first leg is a regular order that arms the others
    fn has_primary(self) -> bool {
        !matches!(self, GroupingMode::OneCancelsOther)
    }
}

/// Validated multi-leg order, signed as one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedOrderSpec {
    mode: GroupingMode,
    legs: Vec<OrderParams>,
}

impl GroupedOrderSpec {
    pub fn mode(&self) -> GroupingMode {
        self.mode
    }

    pub fn legs(&self) -> &[OrderParams] {
        &self.legs
    }

    /// Replace expiry sentinels on every leg
    pub fn resolve_expiry(mut self, now_ms: i64) -> Self {
        for leg in &mut self.legs {
            leg.resolve_expiry(now_ms);
        }
        self
    }
}

/// Validate and normalize legs into a group
pub fn build_group(mode: GroupingMode, mut legs: Vec<OrderParams>) -> ClientResult<GroupedOrderSpec> {
    if legs.len() != mode.leg_count() {
        return Err(ClientError::Validation(format!(
            "{:?} needs {} legs, got {}",
            mode,
            mode.leg_count(),
            legs.len()
        )));
    }

    let market = legs[0].market_index;
    if let Some(other) = legs.iter().find(|l| l.market_index != market) {
        return Err(ClientError::Validation(format!(
            "grouped legs span markets {} and {}",
            market, other.market_index
        )));
    }

    let (conditional_from, closing_side) = if mode.has_primary() {
        let primary = &legs[0];
        if primary.order_type.is_conditional() {
            return Err(ClientError::Validation(
                "primary leg must be a regular order".to_string(),
            ));
        }
        if primary.base_amount <= 0 {
            return Err(ClientError::Validation(
                "primary leg needs a size".to_string(),
            ));
        }
        (1, !primary.is_ask)
    } else {
        // Both legs close the same position
        if legs[0].is_ask != legs[1].is_ask {
            return Err(ClientError::Validation(
                "one-cancels-other legs must share a side".to_string(),
            ));
        }
        (0, legs[0].is_ask)
    };

    for (index, leg) in legs.iter_mut().enumerate() {
        if index > 0 && leg.client_order_index != 0 {
            debug!(
                "Clearing client order index {} on leg {}",
                leg.client_order_index, index
            );
            leg.client_order_index = 0;
        }
        if index < conditional_from {
            continue;
        }

        if !leg.order_type.is_conditional() {
            return Err(ClientError::Validation(format!(
                "leg {} must be a stop-loss or take-profit order",
                index
            )));
        }
        if leg.trigger_price == 0 {
            return Err(ClientError::Validation(format!(
                "leg {} needs a trigger price",
                index
            )));
        }
        leg.base_amount = 0;
        leg.reduce_only = true;
        leg.is_ask = closing_side;
    }

    if matches!(
        mode,
        GroupingMode::OneTriggersOco | GroupingMode::OneCancelsOther
    ) {
        let conditional = &legs[conditional_from..];
        let stops = conditional.iter().filter(|l| l.order_type.is_stop_loss()).count();
        let takes = conditional.iter().filter(|l| l.order_type.is_take_profit()).count();
        if stops != 1 || takes != 1 {
            return Err(ClientError::Validation(
                "mutually cancelling legs need one stop-loss and one take-profit".to_string(),
            ));
        }
    }

    Ok(GroupedOrderSpec { mode, legs })
}

/// Trigger leg of a bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerLeg {
    pub trigger_price: u32,
    /// Resting limit price once triggered; `None` executes at market
    pub limit_price: Option<u32>,
}

impl TriggerLeg {
    pub fn market(trigger_price: u32) -> Self {
        Self {
            trigger_price,
            limit_price: None,
        }
    }
}

/// Entry order with protective take-profit and stop-loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketSpec {
    pub entry: OrderParams,
    pub take_profit: TriggerLeg,
    pub stop_loss: TriggerLeg,
}

impl BracketSpec {
    pub fn into_group(self) -> ClientResult<GroupedOrderSpec> {
        let entry = self.entry;
        let long = !entry.is_ask;

        if entry.price > 0 {
            let tp_beyond = if long {
                self.take_profit.trigger_price > entry.price
            } else {
                self.take_profit.trigger_price < entry.price
            };
            let sl_beyond = if long {
                self.stop_loss.trigger_price < entry.price
            } else {
                self.stop_loss.trigger_price > entry.price
            };
            if !tp_beyond || !sl_beyond {
                return Err(ClientError::Validation(format!(
                    "take-profit {} and stop-loss {} must bracket entry price {}",
                    self.take_profit.trigger_price, self.stop_loss.trigger_price, entry.price
                )));
            }
        }

        let leg = |trigger: TriggerLeg, limit_type: OrderType, market_type: OrderType| {
            let (order_type, price, time_in_force) = match trigger.limit_price {
                Some(price) => (limit_type, price, TimeInForce::GoodTillTime),
                None => (market_type, trigger.trigger_price, TimeInForce::ImmediateOrCancel),
            };
            OrderParams {
                market_index: entry.market_index,
                client_order_index: 0,
                base_amount: 0,
                price,
                is_ask: long,
                order_type,
                time_in_force,
                reduce_only: true,
                trigger_price: trigger.trigger_price,
                order_expiry: DEFAULT_EXPIRY,
            }
        };

        let take_profit = leg(
            self.take_profit,
            OrderType::TakeProfitLimit,
            OrderType::TakeProfit,
        );
        let stop_loss = leg(self.stop_loss, OrderType::StopLossLimit, OrderType::StopLoss);

        build_group(
            GroupingMode::OneTriggersOco,
            vec![entry.clone(), take_profit, stop_loss],
        )
    }
}

/// Independent packages submitted together, each with its own nonce
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    packages: Vec<SignedTransactionPackage>,
}

impl TransactionBatch {
    pub fn packages(&self) -> &[SignedTransactionPackage] {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Check packages form a valid batch: bounded size, strictly increasing nonces
pub fn build_batch(packages: Vec<SignedTransactionPackage>) -> ClientResult<TransactionBatch> {
    if packages.is_empty() || packages.len() > MAX_BATCH_SIZE {
        return Err(ClientError::Validation(format!(
            "batch must hold 1..={} transactions, got {}",
            MAX_BATCH_SIZE,
            packages.len()
        )));
    }
    if let Some(pair) = packages.windows(2).find(|w| w[1].nonce() <= w[0].nonce()) {
        return Err(ClientError::Validation(format!(
            "batch nonces must increase ({} then {})",
            pair[0].nonce(),
            pair[1].nonce()
        )));
    }
    Ok(TransactionBatch { packages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxType;
    use crate::signer::{DigestEngine, SigningBridge, TxContext};
    use serde_json::Value;
    use std::sync::Arc;

    const P: u32 = 300_000;

    fn buy(amount: i64, price: u32) -> OrderParams {
        OrderParams {
            market_index: 0,
            client_order_index: 77,
            base_amount: amount,
            price,
            is_ask: false,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GoodTillTime,
            reduce_only: false,
            trigger_price: 0,
            order_expiry: DEFAULT_EXPIRY,
        }
    }

    fn conditional(order_type: OrderType, trigger: u32) -> OrderParams {
        OrderParams {
            order_type,
            trigger_price: trigger,
            price: trigger,
            client_order_index: 12,
            base_amount: 500,
            time_in_force: TimeInForce::ImmediateOrCancel,
            ..buy(0, trigger)
        }
    }

    #[test]
    fn test_non_first_legs_lose_client_index() {
        let group = build_group(
            GroupingMode::OneTriggersOther,
            vec![buy(1_000, P), conditional(OrderType::StopLoss, P - 100)],
        )
        .unwrap();

        assert_eq!(group.legs()[0].client_order_index, 77);
        assert_eq!(group.legs()[1].client_order_index, 0);
    }

    #[test]
    fn test_trigger_legs_are_closing_and_sizeless() {
        let group = build_group(
            GroupingMode::OneTriggersOco,
            vec![
                buy(1_000, P),
                conditional(OrderType::TakeProfit, P + 100),
                conditional(OrderType::StopLoss, P - 100),
            ],
        )
        .unwrap();

        for leg in &group.legs()[1..] {
            assert_eq!(leg.base_amount, 0);
            assert!(leg.reduce_only);
            assert!(leg.is_ask);
        }
    }

    #[test]
    fn test_leg_count_and_kinds_checked() {
        assert!(build_group(GroupingMode::OneTriggersOco, vec![buy(1, P)]).is_err());

        let two_stops = build_group(
            GroupingMode::OneTriggersOco,
            vec![
                buy(1, P),
                conditional(OrderType::StopLoss, P - 1),
                conditional(OrderType::StopLoss, P - 2),
            ],
        );
        assert!(two_stops.is_err());

        let regular_second = build_group(GroupingMode::OneTriggersOther, vec![buy(1, P), buy(1, P)]);
        assert!(regular_second.is_err());
    }

    #[test]
    fn test_one_cancels_other_keeps_shared_side() {
        let mut tp = conditional(OrderType::TakeProfitLimit, P + 100);
        let mut sl = conditional(OrderType::StopLossLimit, P - 100);
        tp.is_ask = true;
        sl.is_ask = true;

        let group = build_group(GroupingMode::OneCancelsOther, vec![tp, sl]).unwrap();
        assert!(group.legs().iter().all(|l| l.is_ask && l.reduce_only && l.base_amount == 0));
        assert_eq!(group.legs()[0].client_order_index, 12);
    }

    #[test]
    fn test_bracket_rejects_inverted_prices() {
        let bracket = BracketSpec {
            entry: buy(1_000, P),
            take_profit: TriggerLeg::market(P - 10),
            stop_loss: TriggerLeg::market(P + 10),
        };
        assert!(matches!(bracket.into_group(), Err(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn test_bracket_signs_as_one_package() {
        // BUY 1.0 at P with TP at 1.05P and SL at 0.95P
        let bracket = BracketSpec {
            entry: buy(10_000, P),
            take_profit: TriggerLeg::market(P / 100 * 105),
            stop_loss: TriggerLeg::market(P / 100 * 95),
        };
        let group = bracket.into_group().unwrap().resolve_expiry(1_700_000_000_000);
        assert_eq!(group.mode(), GroupingMode::OneTriggersOco);

        let bridge = SigningBridge::new(Arc::new(DigestEngine::new()));
        let package = bridge
            .sign_create_grouped_orders(
                &group,
                TxContext {
                    account_index: 5,
                    api_key_index: 4,
                    nonce: 100,
                    expired_at: 1_700_000_600_000,
                },
            )
            .await
            .unwrap();

        assert_eq!(package.tx_type(), TxType::CreateGroupedOrders);
        let body: Value = serde_json::from_str(package.tx_info()).unwrap();
        assert_eq!(body["GroupingType"], 3);
        assert_eq!(body["Nonce"], 100);
        let orders = body["Orders"].as_array().unwrap();
        assert_eq!(orders.len(), 3);
        for leg in &orders[1..] {
            assert_eq!(leg["BaseAmount"], 0);
            assert_eq!(leg["ReduceOnly"], 1);
            assert_eq!(leg["IsAsk"], 1);
        }
    }

    #[test]
    fn test_batch_requires_increasing_nonces() {
        let package = |n| SignedTransactionPackage::for_test(TxType::CancelOrder, n, "0x");
        assert!(build_batch(vec![package(3), package(4)]).is_ok());
        assert!(build_batch(vec![package(4), package(4)]).is_err());
        assert!(build_batch(Vec::new()).is_err());
    }
}
