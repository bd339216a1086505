//! Token usage and pricing shapes.

use serde::{Deserialize, Serialize};

/// Token counts of a single completion request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt.saturating_add(completion),
        }
    }
}

/// Usage attached to a finalized assistant message, as carried by the
/// `stats` chat event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUsage {
    pub tokens: TokenUsage,
    #[serde(
        rename = "totalPriceUSD",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub total_price_usd: Option<f64>,
}

impl MessageUsage {
    pub fn new(tokens: TokenUsage) -> Self {
        Self {
            tokens,
            total_price_usd: None,
        }
    }

    pub fn with_price(mut self, total_price_usd: f64) -> Self {
        self.total_price_usd = Some(total_price_usd);
        self
    }
}

/// Per-model price rates in USD per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRate {
    #[serde(rename = "promptPriceUSDPer1000")]
    pub prompt_usd_per_1000: f64,
    #[serde(rename = "completionPriceUSDPer1000")]
    pub completion_usd_per_1000: f64,
    #[serde(rename = "monthlyUsageLimitUSD")]
    pub monthly_usage_limit_usd: f64,
}

impl PriceRate {
    pub fn price(&self, tokens: &TokenUsage) -> f64 {
        f64::from(tokens.prompt) / 1000.0 * self.prompt_usd_per_1000
            + f64::from(tokens.completion) / 1000.0 * self.completion_usd_per_1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_sum_of_prompt_and_completion() {
        let usage = TokenUsage::new(10, 3);
        assert_eq!(usage.total, 13);
    }

    #[test]
    fn stats_payload_shape() {
        let usage = MessageUsage::new(TokenUsage::new(10, 3)).with_price(0.5);
        let json = serde_json::to_value(&usage).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "tokens": {"prompt": 10, "completion": 3, "total": 13},
                "totalPriceUSD": 0.5
            })
        );
    }

    #[test]
    fn price_is_charged_per_thousand_tokens() {
        let rate = PriceRate {
            prompt_usd_per_1000: 0.0015,
            completion_usd_per_1000: 0.002,
            monthly_usage_limit_usd: 10.0,
        };

        let price = rate.price(&TokenUsage::new(2000, 500));
        assert!((price - 0.004).abs() < 1e-12);
    }

    #[test]
    fn usage_without_price_parses() {
        let usage: MessageUsage =
            serde_json::from_str(r#"{"tokens":{"prompt":1,"completion":2,"total":3}}"#).unwrap();
        assert_eq!(usage.tokens.total, 3);
        assert!(usage.total_price_usd.is_none());
    }
}
