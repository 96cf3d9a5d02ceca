use super::{RepositoryError, RepositoryResult, load, modify};
use crate::store::FileStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const ECONOMY_KEY: &str = "economy";
/// Coins paid by `claim_daily`
pub const DAILY_REWARD: i64 = 100;
pub const DAILY_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    #[serde(default)]
    pub balance: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_daily: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct EconomyDocument {
    #[serde(default)]
    wallets: BTreeMap<String, Wallet>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl EconomyDocument {
    fn wallet_mut(&mut self, user_id: u64) -> &mut Wallet {
        self.wallets.entry(user_id.to_string()).or_default()
    }
}

/// Result of a daily claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyClaim {
    Claimed { reward: i64, balance: i64 },
    Cooldown { remaining: Duration },
}

/// Coin balances in the `economy` document
#[derive(Debug, Clone)]
pub struct EconomyRepository {
    store: FileStore,
}

impl EconomyRepository {
    #[must_use]
    pub const fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// # Errors
    /// Store or shape errors.
    pub async fn wallet(&self, user_id: u64) -> RepositoryResult<Wallet> {
        let document: EconomyDocument = load(&self.store, ECONOMY_KEY).await?;
        Ok(document
            .wallets
            .get(&user_id.to_string())
            .cloned()
            .unwrap_or_default())
    }

    /// # Errors
    /// Store or shape errors.
    pub async fn balance(&self, user_id: u64) -> RepositoryResult<i64> {
        Ok(self.wallet(user_id).await?.balance)
    }

    /// Add coins, returning the new balance
    ///
    /// # Errors
    /// `InvalidAmount` for non-positive amounts, store or shape errors.
    pub async fn deposit(&self, user_id: u64, amount: i64) -> RepositoryResult<i64> {
        if amount <= 0 {
            return Err(RepositoryError::InvalidAmount(amount));
        }
        modify(&self.store, ECONOMY_KEY, |document: &mut EconomyDocument| {
            let wallet = document.wallet_mut(user_id);
            wallet.balance = wallet.balance.saturating_add(amount);
            Ok(wallet.balance)
        })
        .await
    }

    /// Take coins, returning the new balance
    ///
    /// # Errors
    /// `InsufficientFunds` if the balance would go negative, `InvalidAmount`
    /// for non-positive amounts, store or shape errors.
    pub async fn withdraw(&self, user_id: u64, amount: i64) -> RepositoryResult<i64> {
        if amount <= 0 {
            return Err(RepositoryError::InvalidAmount(amount));
        }
        modify(&self.store, ECONOMY_KEY, |document: &mut EconomyDocument| {
            let wallet = document.wallet_mut(user_id);
            if wallet.balance < amount {
                return Err(RepositoryError::InsufficientFunds {
                    balance: wallet.balance,
                    needed: amount,
                });
            }
            wallet.balance -= amount;
            Ok(wallet.balance)
        })
        .await
    }

    /// Move coins between two wallets in one write, returning the payer's
    /// new balance
    ///
    /// # Errors
    /// `InsufficientFunds` if the payer cannot cover the amount,
    /// `InvalidAmount` for non-positive amounts, store or shape errors.
    pub async fn transfer(&self, from: u64, to: u64, amount: i64) -> RepositoryResult<i64> {
        if amount <= 0 {
            return Err(RepositoryError::InvalidAmount(amount));
        }
        modify(&self.store, ECONOMY_KEY, |document: &mut EconomyDocument| {
            let payer = document.wallet_mut(from);
            if payer.balance < amount {
                return Err(RepositoryError::InsufficientFunds {
                    balance: payer.balance,
                    needed: amount,
                });
            }
            payer.balance -= amount;
            let remaining = payer.balance;

            let payee = document.wallet_mut(to);
            payee.balance = payee.balance.saturating_add(amount);
            Ok(remaining)
        })
        .await
    }

    /// Pay the daily reward unless the user claimed within the cooldown
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn claim_daily(
        &self,
        user_id: u64,
        now: DateTime<Utc>,
    ) -> RepositoryResult<DailyClaim> {
        let cooldown = Duration::hours(DAILY_COOLDOWN_HOURS);
        modify(&self.store, ECONOMY_KEY, |document: &mut EconomyDocument| {
            let wallet = document.wallet_mut(user_id);
            if let Some(next) = wallet.last_daily.map(|last| last + cooldown) {
                if next > now {
                    return Ok(DailyClaim::Cooldown {
                        remaining: next - now,
                    });
                }
            }
            wallet.balance = wallet.balance.saturating_add(DAILY_REWARD);
            wallet.last_daily = Some(now);
            Ok(DailyClaim::Claimed {
                reward: DAILY_REWARD,
                balance: wallet.balance,
            })
        })
        .await
    }
}
