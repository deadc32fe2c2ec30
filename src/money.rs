//! Fixed-point money stored as integer minor units (pesewas).

use crate::errors::ServiceError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of decimal places every amount carries.
pub const SCALE: u32 = 2;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, SCALE)
    }

    /// Converts a decimal amount, rejecting anything finer than a minor unit.
    pub fn try_from_decimal(amount: Decimal) -> Result<Self, ServiceError> {
        let normalized = amount.normalize();
        if normalized.scale() > SCALE {
            return Err(ServiceError::ValidationError(format!(
                "amount {} has more than {} decimal places",
                amount, SCALE
            )));
        }

        let mut scaled = normalized;
        scaled.rescale(SCALE);
        let minor = scaled
            .mantissa()
            .try_into()
            .map_err(|_| ServiceError::ValidationError(format!("amount {} is out of range", amount)))?;
        Ok(Self(minor))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}
