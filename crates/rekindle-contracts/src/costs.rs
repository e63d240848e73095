use serde::{Deserialize, Serialize};

/// $30 per 1M tokens, one image = 1290 tokens.
pub const COST_PER_OPERATION_USD: f64 = 0.0387;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub operations: u64,
    pub per_operation_usd: f64,
    pub total_usd: f64,
    pub currency: String,
}

pub fn cost_estimate(operations: u64) -> CostBreakdown {
    CostBreakdown {
        operations,
        per_operation_usd: COST_PER_OPERATION_USD,
        total_usd: operations as f64 * COST_PER_OPERATION_USD,
        currency: "USD".to_string(),
    }
}
