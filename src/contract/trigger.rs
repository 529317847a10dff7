use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ControlError, ControlResult};

/// How the trigger price is defined
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Fixed price
    Limit,
    /// Price on a line through two anchor points
    Line,
}

/// Comparison of the market price against the trigger price
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::GreaterOrEqual => ">=",
            Operator::LessOrEqual => "<=",
        }
    }
}

impl FromStr for Operator {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            ">=" => Ok(Operator::GreaterOrEqual),
            "<=" => Ok(Operator::LessOrEqual),
            other => Err(ControlError::validation(format!("operator '{}' is invalid", other))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PriceLine {
    Fixed(Decimal),
    Trendline {
        time_1: DateTime<Utc>,
        price_1: Decimal,
        time_2: DateTime<Utc>,
        price_2: Decimal,
        /// Fraction applied multiplicatively (0.01 = +1%)
        offset: Decimal,
    },
}

/// Maps a timestamp to a price threshold.
///
/// Only constructible through [`Trigger::fixed`] and [`Trigger::trendline`], so a
/// trendline with two anchors at the same instant cannot exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    trigger_type: TriggerType,
    operator: Operator,
    line: PriceLine,
}

impl Trigger {
    pub fn fixed(trigger_type: TriggerType, operator: Operator, price: Decimal) -> ControlResult<Self> {
        if trigger_type != TriggerType::Limit {
            return Err(ControlError::validation("a fixed-price trigger must have trigger_type 'limit'"));
        }
        if price <= Decimal::ZERO {
            return Err(ControlError::validation("trigger price must be positive"));
        }
        Ok(Self {
            trigger_type,
            operator,
            line: PriceLine::Fixed(price),
        })
    }

    pub fn trendline(
        trigger_type: TriggerType,
        operator: Operator,
        (time_1, price_1): (DateTime<Utc>, Decimal),
        (time_2, price_2): (DateTime<Utc>, Decimal),
        offset: Decimal,
    ) -> ControlResult<Self> {
        if trigger_type != TriggerType::Line {
            return Err(ControlError::validation("a trendline trigger must have trigger_type 'line'"));
        }
        if time_1 == time_2 {
            return Err(ControlError::validation("time_1 and time_2 must differ"));
        }
        if price_1 <= Decimal::ZERO || price_2 <= Decimal::ZERO {
            return Err(ControlError::validation("trendline prices must be positive"));
        }
        Ok(Self {
            trigger_type,
            operator,
            line: PriceLine::Trendline {
                time_1,
                price_1,
                time_2,
                price_2,
                offset,
            },
        })
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger_type
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn is_trendline(&self) -> bool {
        matches!(self.line, PriceLine::Trendline { .. })
    }

    /// Trigger price at `as_of`.
    ///
    /// Trendlines extrapolate on both sides of their anchors. Fails when the
    /// extrapolated price does not fit a `Decimal`.
    pub fn price_at(&self, as_of: DateTime<Utc>) -> ControlResult<Decimal> {
        match &self.line {
            PriceLine::Fixed(price) => Ok(*price),
            PriceLine::Trendline {
                time_1,
                price_1,
                time_2,
                price_2,
                offset,
            } => {
                let span = Decimal::from((*time_2 - *time_1).num_milliseconds());
                let elapsed = Decimal::from((as_of - *time_1).num_milliseconds());

                price_2
                    .checked_sub(*price_1)
                    .and_then(|rise| rise.checked_mul(elapsed))
                    .and_then(|delta| delta.checked_div(span))
                    .and_then(|delta| price_1.checked_add(delta))
                    .and_then(|price| Decimal::ONE.checked_add(*offset).and_then(|f| price.checked_mul(f)))
                    .ok_or_else(|| ControlError::validation("trendline price is out of range"))
            }
        }
    }
}
