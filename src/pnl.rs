// src/pnl.rs
//! Profit and loss arithmetic shared by signals, ETF trades and deals.
//!
//! Nothing in the store holds a P&L figure; every view derives it here from
//! entry price, current price, quantity and direction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "BUY")]
    Long,
    #[serde(alias = "SELL")]
    Short,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlInputs {
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: i64,
    pub direction: Direction,
    pub target_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PnlSnapshot {
    pub investment: f64,
    pub current_value: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub target_value: f64,
    pub target_profit: f64,
}

impl PnlInputs {
    pub fn snapshot(&self) -> PnlSnapshot {
        let qty = self.quantity as f64;
        let investment = self.entry_price * qty;
        let current_value = self.current_price * qty;
        let pnl = (self.current_price - self.entry_price) * qty * self.direction.sign();
        let pnl_percent = if investment > 0.0 {
            pnl * 100.0 / investment
        } else {
            0.0
        };
        let target_value = self.target_price.map(|tp| tp * qty).unwrap_or(0.0);
        let target_profit = if self.target_price.is_some() {
            (target_value - investment) * self.direction.sign()
        } else {
            0.0
        };

        PnlSnapshot {
            investment,
            current_value,
            pnl,
            pnl_percent,
            target_value,
            target_profit,
        }
    }
}

/// Anything whose value moves with the market price of one symbol.
pub trait Priced {
    fn symbol(&self) -> &str;
    fn is_active(&self) -> bool;
    fn pnl_inputs(&self) -> PnlInputs;
    fn apply_price(&mut self, price: f64, at: chrono::DateTime<chrono::Utc>);

    fn pnl(&self) -> PnlSnapshot {
        self.pnl_inputs().snapshot()
    }
}

/// Percent move from `previous` to `current`; zero without a usable base.
pub fn change_percent(previous: f64, current: f64) -> f64 {
    if previous > 0.0 {
        (current - previous) * 100.0 / previous
    } else {
        0.0
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub total_positions: usize,
    pub total_investment: f64,
    pub total_current_value: f64,
    pub total_pnl: f64,
    pub total_pnl_percent: f64,
    pub winning: usize,
    pub losing: usize,
}

impl PortfolioSummary {
    pub fn from_snapshots<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a PnlSnapshot>,
    {
        let mut summary = PortfolioSummary::default();
        for snap in snapshots {
            summary.total_positions += 1;
            summary.total_investment += snap.investment;
            summary.total_current_value += snap.current_value;
            summary.total_pnl += snap.pnl;
            if snap.pnl > 0.0 {
                summary.winning += 1;
            } else if snap.pnl < 0.0 {
                summary.losing += 1;
            }
        }
        summary.total_pnl_percent = if summary.total_investment > 0.0 {
            summary.total_pnl * 100.0 / summary.total_investment
        } else {
            0.0
        };
        summary.total_investment = round2(summary.total_investment);
        summary.total_current_value = round2(summary.total_current_value);
        summary.total_pnl = round2(summary.total_pnl);
        summary.total_pnl_percent = round2(summary.total_pnl_percent);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(entry: f64, current: f64, qty: i64, direction: Direction) -> PnlInputs {
        PnlInputs {
            entry_price: entry,
            current_price: current,
            quantity: qty,
            direction,
            target_price: None,
        }
    }

    #[test]
    fn long_profits_when_price_rises() {
        let snap = inputs(100.0, 110.0, 10, Direction::Long).snapshot();
        assert_eq!(snap.investment, 1000.0);
        assert_eq!(snap.current_value, 1100.0);
        assert_eq!(snap.pnl, 100.0);
        assert_eq!(snap.pnl_percent, 10.0);
    }

    #[test]
    fn short_profits_when_price_falls() {
        let snap = inputs(100.0, 90.0, 10, Direction::Short).snapshot();
        assert_eq!(snap.pnl, 100.0);
        assert_eq!(snap.pnl_percent, 10.0);

        let loss = inputs(100.0, 105.0, 4, Direction::Short).snapshot();
        assert_eq!(loss.pnl, -20.0);
    }

    #[test]
    fn zero_investment_gives_zero_percent() {
        let snap = inputs(0.0, 50.0, 10, Direction::Long).snapshot();
        assert_eq!(snap.pnl_percent, 0.0);
        let empty = inputs(100.0, 120.0, 0, Direction::Long).snapshot();
        assert_eq!(empty.pnl, 0.0);
        assert_eq!(empty.pnl_percent, 0.0);
    }

    #[test]
    fn target_metrics_follow_quantity() {
        let mut input = inputs(200.0, 210.0, 5, Direction::Long);
        input.target_price = Some(230.0);
        let snap = input.snapshot();
        assert_eq!(snap.target_value, 1150.0);
        assert_eq!(snap.target_profit, 150.0);
    }

    #[test]
    fn change_percent_needs_a_positive_base() {
        assert_eq!(change_percent(0.0, 10.0), 0.0);
        assert_eq!(change_percent(200.0, 210.0), 5.0);
    }

    #[test]
    fn summary_counts_winners_and_losers() {
        let snaps = [
            inputs(100.0, 110.0, 10, Direction::Long).snapshot(),
            inputs(50.0, 45.0, 10, Direction::Long).snapshot(),
            inputs(20.0, 20.0, 10, Direction::Long).snapshot(),
        ];
        let summary = PortfolioSummary::from_snapshots(snaps.iter());
        assert_eq!(summary.total_positions, 3);
        assert_eq!(summary.winning, 1);
        assert_eq!(summary.losing, 1);
        assert_eq!(summary.total_investment, 1700.0);
        assert_eq!(summary.total_pnl, 50.0);
        assert_eq!(summary.total_pnl_percent, 2.94);
    }
}
