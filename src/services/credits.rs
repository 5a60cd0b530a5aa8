use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::model_config::Quality;

/// External credit balance, charged per generated image.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct the cost of `count` images at `quality`, or fail without
    /// deducting anything.
    async fn reserve(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError>;

    async fn refund(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError>;
}

fn cost(quality: Quality, count: u32) -> u32 {
    quality.credit_cost() * count
}

/// Balances in the `user_credits` table.
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn reserve(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError> {
        let required = cost(quality, count);
        match queries::deduct_credits(&self.pool, user_id, required as i32).await? {
            Some(balance) => {
                tracing::debug!(user_id, required, balance, "Credits reserved");
                Ok(())
            }
            None => Err(CreditError::Insufficient { required }),
        }
    }

    async fn refund(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError> {
        let amount = cost(quality, count);
        let balance = queries::add_credits(&self.pool, user_id, amount as i32).await?;
        tracing::debug!(user_id, amount, balance, "Credits refunded");
        Ok(())
    }
}

/// Process-local balances.
#[derive(Default)]
pub struct MemoryCreditLedger {
    balances: Mutex<HashMap<String, u32>>,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: &str, credits: u32) -> Self {
        let ledger = Self::default();
        ledger.set_balance(user_id, credits);
        ledger
    }

    pub fn set_balance(&self, user_id: &str, credits: u32) {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        balances.insert(user_id.to_string(), credits);
    }

    pub fn balance(&self, user_id: &str) -> u32 {
        let balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        balances.get(user_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn reserve(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError> {
        let required = cost(quality, count);
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        let balance = balances.entry(user_id.to_string()).or_insert(0);
        if *balance < required {
            return Err(CreditError::Insufficient { required });
        }
        *balance -= required;
        Ok(())
    }

    async fn refund(&self, user_id: &str, quality: Quality, count: u32) -> Result<(), CreditError> {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        *balances.entry(user_id.to_string()).or_insert(0) += cost(quality, count);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("Insufficient credits: {required} required")]
    Insufficient { required: u32 },

    #[error("Credit ledger error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_refund() {
        let ledger = MemoryCreditLedger::with_balance("u1", 10);

        ledger.reserve("u1", Quality::HdPlus, 2).await.unwrap();
        assert_eq!(ledger.balance("u1"), 6);

        ledger.refund("u1", Quality::HdPlus, 1).await.unwrap();
        assert_eq!(ledger.balance("u1"), 8);
    }

    #[tokio::test]
    async fn test_insufficient_leaves_balance_untouched() {
        let ledger = MemoryCreditLedger::with_balance("u1", 2);

        let err = ledger.reserve("u1", Quality::UltraHd, 1).await.unwrap_err();
        assert!(matches!(err, CreditError::Insufficient { required: 3 }));
        assert_eq!(ledger.balance("u1"), 2);
    }
}
