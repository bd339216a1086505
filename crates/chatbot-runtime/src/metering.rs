//! Usage metering and monthly budget gating.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatbot_core::{MessageUsage, PriceRate, TokenUsage};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// What a usage record was spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UsageMode {
    Chat,
    Agent,
    AgentConv,
    Google,
    AgentPlugin,
    Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: String,
    pub model_id: String,
    pub mode: UsageMode,
    pub tokens: TokenUsage,
    #[serde(
        rename = "totalPriceUSD",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub total_price_usd: Option<f64>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeteringError {
    #[error("Uh-oh! You've reached the monthly API limit. Please reach out to the admin team for assistance.")]
    BudgetExhausted,
    #[error("usage storage error: {0}")]
    Storage(String),
}

/// Storage of per-user limits, model prices and usage records.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// The user's own monthly limit, if one is set.
    async fn monthly_limit_usd(&self, user_id: &str) -> Result<Option<f64>, MeteringError>;

    /// Spend of the user in `[from, to)`.
    async fn used_usd(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64, MeteringError>;

    async fn price_rate(&self, model_id: &str) -> Result<Option<PriceRate>, MeteringError>;

    async fn record(&self, record: UsageRecord) -> Result<(), MeteringError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    limits: RwLock<HashMap<String, f64>>,
    rates: RwLock<HashMap<String, PriceRate>>,
    records: RwLock<Vec<UsageRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_user_limit(&self, user_id: impl Into<String>, limit_usd: f64) {
        self.limits.write().await.insert(user_id.into(), limit_usd);
    }

    pub async fn set_price_rate(&self, model_id: impl Into<String>, rate: PriceRate) {
        self.rates.write().await.insert(model_id.into(), rate);
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn monthly_limit_usd(&self, user_id: &str) -> Result<Option<f64>, MeteringError> {
        Ok(self.limits.read().await.get(user_id).copied())
    }

    async fn used_usd(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64, MeteringError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| record.user_id == user_id && record.date >= from && record.date < to)
            .filter_map(|record| record.total_price_usd)
            .sum())
    }

    async fn price_rate(&self, model_id: &str) -> Result<Option<PriceRate>, MeteringError> {
        Ok(self.rates.read().await.get(model_id).copied())
    }

    async fn record(&self, record: UsageRecord) -> Result<(), MeteringError> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// Budget checks and usage recording on top of a ledger.
#[derive(Clone)]
pub struct Meter {
    ledger: Arc<dyn UsageLedger>,
    default_limit_usd: f64,
}

impl Meter {
    /// `default_limit_usd` applies to users without their own limit.
    /// Negative means unlimited.
    pub fn new(ledger: Arc<dyn UsageLedger>, default_limit_usd: f64) -> Self {
        Self {
            ledger,
            default_limit_usd,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        &self.ledger
    }

    pub async fn used_budget_percent(&self, user_id: &str) -> Result<f64, MeteringError> {
        self.used_budget_percent_at(user_id, Utc::now()).await
    }

    /// Share of the monthly limit spent in the calendar month of `now`,
    /// capped at 100. Unlimited users are always at 0.
    pub async fn used_budget_percent_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, MeteringError> {
        let limit = self
            .ledger
            .monthly_limit_usd(user_id)
            .await?
            .unwrap_or(self.default_limit_usd);
        if limit < 0.0 {
            return Ok(0.0);
        }

        let (from, to) = month_bounds(now)?;
        let used = self.ledger.used_usd(user_id, from, to).await?;
        if limit == 0.0 {
            return Ok(100.0);
        }
        Ok((used / limit * 100.0).min(100.0))
    }

    pub async fn verify(&self, user_id: &str) -> Result<(), MeteringError> {
        let percent = self.used_budget_percent(user_id).await?;
        if percent >= 100.0 {
            warn!(user = user_id, "monthly budget exhausted");
            return Err(MeteringError::BudgetExhausted);
        }
        Ok(())
    }

    /// Prices and stores usage. The price is left out when the model has
    /// no known rate.
    pub async fn record(
        &self,
        user_id: &str,
        model_id: &str,
        mode: UsageMode,
        tokens: TokenUsage,
    ) -> Result<MessageUsage, MeteringError> {
        let price = self
            .ledger
            .price_rate(model_id)
            .await?
            .map(|rate| rate.price(&tokens));

        self.ledger
            .record(UsageRecord {
                user_id: user_id.to_string(),
                model_id: model_id.to_string(),
                mode,
                tokens,
                total_price_usd: price,
                date: Utc::now(),
            })
            .await?;

        debug!(
            user = user_id,
            model = model_id,
            tokens = tokens.total,
            price_usd = price.unwrap_or_default(),
            "usage recorded"
        );

        let usage = MessageUsage::new(tokens);
        Ok(match price {
            Some(price) => usage.with_price(price),
            None => usage,
        })
    }
}

fn month_bounds(now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), MeteringError> {
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let start = first_of_month(now.year(), now.month())?;
    let end = first_of_month(next_year, next_month)?;
    Ok((start, end))
}

fn first_of_month(year: i32, month: u32) -> Result<DateTime<Utc>, MeteringError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MeteringError::Storage(format!("invalid month {year}-{month}")))
}
