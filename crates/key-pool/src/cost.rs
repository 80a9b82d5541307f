//! Credit cost estimation for Tavily operations
//!
//! Costs follow Tavily's published pricing. Crawl and research vary widely
//! with the request, so they are estimated conservatively and treated as
//! expensive: a key that cannot cover the estimate is skipped rather than
//! soft-allowed.

use std::fmt;

use serde_json::Value;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAP_COST_PER_PAGE: f64 = 0.15;

/// Credit-metered Tavily operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    Extract,
    Crawl,
    Map,
    Research,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::Extract => "extract",
            Operation::Crawl => "crawl",
            Operation::Map => "map",
            Operation::Research => "research",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search" => Some(Operation::Search),
            "extract" => Some(Operation::Extract),
            "crawl" => Some(Operation::Crawl),
            "map" => Some(Operation::Map),
            "research" => Some(Operation::Research),
            _ => None,
        }
    }

    /// Whether low credits hard-block this operation instead of soft-allowing.
    pub fn is_expensive(&self) -> bool {
        matches!(self, Operation::Crawl | Operation::Research)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameters that influence cost. Everything else in the payload is
/// ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationParams {
    pub search_depth: Option<String>,
    pub extract_depth: Option<String>,
    /// Number of URLs for extract; `None` when the payload carries no list.
    pub url_count: Option<usize>,
    pub max_depth: Option<i64>,
    pub limit: Option<i64>,
    pub model: Option<String>,
}

impl OperationParams {
    /// Pick the cost-relevant fields out of a tool payload. Fields of the wrong
    /// type are treated as absent.
    pub fn from_payload(payload: &Value) -> Self {
        let string = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_owned);
        let integer = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .map(|v| v as i64)
        };

        Self {
            search_depth: string("search_depth"),
            extract_depth: string("extract_depth"),
            url_count: payload.get("urls").and_then(Value::as_array).map(Vec::len),
            max_depth: integer("max_depth"),
            limit: integer("limit"),
            model: string("model"),
        }
    }

    fn extract_per_unit(&self) -> f64 {
        match self.extract_depth.as_deref() {
            Some("advanced") => 0.4,
            _ => 0.2,
        }
    }
}

/// Credit range for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationCost {
    pub min: f64,
    pub max: f64,
    pub estimated: f64,
}

impl OperationCost {
    const fn flat(cost: f64) -> Self {
        Self {
            min: cost,
            max: cost,
            estimated: cost,
        }
    }
}

/// Estimate the credit cost of `operation` with `params`.
pub fn estimate(operation: Operation, params: &OperationParams) -> OperationCost {
    match operation {
        Operation::Search => search_cost(params),
        Operation::Extract => extract_cost(params),
        Operation::Crawl => crawl_cost(params),
        Operation::Map => map_cost(params),
        Operation::Research => research_cost(params),
    }
}

/// Estimate by operation name. Unknown names cost one credit.
pub fn estimate_by_name(operation: &str, params: &OperationParams) -> OperationCost {
    match Operation::parse(operation) {
        Some(op) => estimate(op, params),
        None => OperationCost::flat(1.0),
    }
}

fn search_cost(params: &OperationParams) -> OperationCost {
    // basic, fast and ultra-fast all bill one credit
    match params.search_depth.as_deref() {
        Some("advanced") => OperationCost::flat(2.0),
        _ => OperationCost::flat(1.0),
    }
}

fn extract_cost(params: &OperationParams) -> OperationCost {
    let urls = params.url_count.unwrap_or(1) as f64;
    OperationCost::flat(params.extract_per_unit() * urls)
}

fn map_cost(params: &OperationParams) -> OperationCost {
    let limit = params.limit.map_or(DEFAULT_PAGE_LIMIT, |l| l.max(0));
    OperationCost {
        min: MAP_COST_PER_PAGE * limit.min(10) as f64,
        max: MAP_COST_PER_PAGE * limit as f64,
        estimated: MAP_COST_PER_PAGE * limit.min(DEFAULT_PAGE_LIMIT) as f64,
    }
}

fn crawl_cost(params: &OperationParams) -> OperationCost {
    let map = map_cost(params);
    // The extract half treats a zero or missing limit as the default page count.
    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_PAGE_LIMIT);
    let per_page = params.extract_per_unit();

    OperationCost {
        min: map.min + per_page * limit.min(10) as f64,
        max: map.max + per_page * limit as f64,
        estimated: map.estimated + per_page * limit.min(DEFAULT_PAGE_LIMIT) as f64,
    }
}

fn research_cost(params: &OperationParams) -> OperationCost {
    match params.model.as_deref() {
        Some("mini") => OperationCost {
            min: 10.0,
            max: 50.0,
            estimated: 25.0,
        },
        Some("pro") => OperationCost {
            min: 50.0,
            max: 200.0,
            estimated: 100.0,
        },
        _ => OperationCost {
            min: 10.0,
            max: 200.0,
            estimated: 50.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> OperationParams {
        OperationParams::from_payload(&v)
    }

    #[test]
    fn search_depths() {
        assert_eq!(estimate(Operation::Search, &params(json!({}))).estimated, 1.0);
        assert_eq!(
            estimate(Operation::Search, &params(json!({"search_depth": "fast"}))).estimated,
            1.0
        );
        assert_eq!(
            estimate(Operation::Search, &params(json!({"search_depth": "advanced"}))),
            OperationCost::flat(2.0)
        );
    }

    #[test]
    fn extract_scales_with_url_count() {
        assert_eq!(estimate(Operation::Extract, &params(json!({}))).estimated, 0.2);
        let cost = estimate(
            Operation::Extract,
            &params(json!({"urls": ["a", "b", "c"], "extract_depth": "advanced"})),
        );
        assert!((cost.estimated - 1.2).abs() < 1e-9);
        assert_eq!(cost.min, cost.max);
    }

    #[test]
    fn map_defaults_and_clamps() {
        let cost = estimate(Operation::Map, &params(json!({})));
        assert_eq!(cost.estimated, 7.5);
        assert!((cost.min - 1.5).abs() < 1e-9);
        assert_eq!(cost.max, 7.5);

        let cost = estimate(Operation::Map, &params(json!({"limit": 200})));
        assert_eq!(cost.estimated, 7.5);
        assert!((cost.max - 30.0).abs() < 1e-9);

        let cost = estimate(Operation::Map, &params(json!({"limit": -3})));
        assert_eq!(cost, OperationCost::flat(0.0));
    }

    #[test]
    fn crawl_basic_at_default_limit_costs_seventeen_and_a_half() {
        let cost = estimate(
            Operation::Crawl,
            &params(json!({"limit": 50, "extract_depth": "basic"})),
        );
        assert_eq!(cost.estimated, 17.5);
        assert_eq!(cost.estimated.to_string(), "17.5");
    }

    #[test]
    fn crawl_zero_limit_uses_default_for_extract_half() {
        let cost = estimate(Operation::Crawl, &params(json!({"limit": 0})));
        // map half is zero, extract half is 50 pages at 0.2
        assert!((cost.estimated - 10.0).abs() < 1e-9);
        assert!((cost.min - 2.0).abs() < 1e-9);
    }

    #[test]
    fn crawl_advanced_small_limit() {
        let cost = estimate(
            Operation::Crawl,
            &params(json!({"limit": 5, "extract_depth": "advanced"})),
        );
        assert!((cost.estimated - (0.75 + 2.0)).abs() < 1e-9);
        assert!((cost.min - cost.max).abs() < 1e-9);
    }

    #[test]
    fn research_models() {
        assert_eq!(
            estimate(Operation::Research, &params(json!({"model": "pro"}))),
            OperationCost {
                min: 50.0,
                max: 200.0,
                estimated: 100.0
            }
        );
        assert_eq!(
            estimate(Operation::Research, &params(json!({"model": "mini"}))).estimated,
            25.0
        );
        assert_eq!(estimate(Operation::Research, &params(json!({}))).estimated, 50.0);
    }

    #[test]
    fn unknown_operation_costs_one() {
        assert_eq!(
            estimate_by_name("summarize", &OperationParams::default()),
            OperationCost::flat(1.0)
        );
        assert_eq!(
            estimate_by_name("research", &OperationParams::default()).estimated,
            50.0
        );
    }

    #[test]
    fn only_crawl_and_research_are_expensive() {
        assert!(Operation::Crawl.is_expensive());
        assert!(Operation::Research.is_expensive());
        assert!(!Operation::Search.is_expensive());
        assert!(!Operation::Extract.is_expensive());
        assert!(!Operation::Map.is_expensive());
    }

    #[test]
    fn payload_fields_of_wrong_type_are_ignored() {
        let p = params(json!({"limit": "ten", "urls": "x", "model": 3}));
        assert_eq!(p, OperationParams::default());
    }
}
