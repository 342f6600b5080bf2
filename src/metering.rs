use crate::chat::segment::add_merged;
use crate::chat::service::ChatServiceError;
use crate::chat::{ChatRequest, ChatSegment, FinishReason, TokenUsage, tokenizer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Per-token prices for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceConfig {
    #[serde(rename = "input_fresh")]
    pub input_price: Decimal,
    #[serde(rename = "out")]
    pub output_price: Decimal,
    #[serde(rename = "input_cached")]
    pub cached_price: Decimal,
}

impl PriceConfig {
    pub fn is_free(&self) -> bool {
        self.input_price.is_zero() && self.output_price.is_zero() && self.cached_price.is_zero()
    }
}

/// Prepaid per-model allowance, consumed before money: whole calls first
/// (`counts`), then raw tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelGrant {
    pub counts: i64,
    pub tokens: i64,
}

/// What one request costs, split the way the ledger wants it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_cost: Decimal,
    pub counts_used: i64,
    pub tokens_used: i64,
}

impl CostBreakdown {
    pub fn total_cost(&self) -> Decimal {
        self.input_cost + self.output_cost + self.cache_cost
    }
}

/// Request-scoped balance enforcement. `set_cost` recomputes the whole-span
/// cost from absolute token counts (it does not accumulate), so repeated
/// calls with growing counts yield a monotonically growing cost.
#[derive(Debug, Clone)]
pub struct BalanceCalculator {
    balance: Decimal,
    grant: ModelGrant,
    cost: CostBreakdown,
}

impl BalanceCalculator {
    pub fn new(balance: Decimal, grant: ModelGrant) -> Self {
        Self {
            balance,
            grant,
            cost: CostBreakdown::default(),
        }
    }

    pub fn set_cost(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        cache_tokens: u64,
        price: &PriceConfig,
    ) {
        // Prepaid whole calls cover everything.
        if self.grant.counts > 0 {
            self.cost = CostBreakdown {
                counts_used: 1,
                ..Default::default()
            };
            return;
        }

        // Grant tokens cover output first (typically the expensive side),
        // then fresh input; the remainder is billed against the money
        // balance. Cached input is billed at its own price only.
        let input = input_tokens.saturating_sub(cache_tokens) as i64;
        let output = output_tokens as i64;
        let mut remaining = self.grant.tokens.max(0);
        let billed_output = (output - remaining).max(0);
        remaining = (remaining - output).max(0);
        let billed_input = (input - remaining).max(0);
        remaining = (remaining - input).max(0);

        self.cost = CostBreakdown {
            input_cost: price.input_price * Decimal::from(billed_input),
            output_cost: price.output_price * Decimal::from(billed_output),
            cache_cost: price.cached_price * Decimal::from(cache_tokens),
            counts_used: 0,
            tokens_used: self.grant.tokens.max(0) - remaining,
        };
    }

    pub fn is_sufficient(&self) -> bool {
        self.grant.counts >= self.cost.counts_used
            && self.grant.tokens >= 0
            && self.balance - self.cost.total_cost() >= Decimal::ZERO
    }

    pub fn cost(&self) -> &CostBreakdown {
        &self.cost
    }
}

/// The reconciled outcome of one metered request. Produced exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub usage: TokenUsage,
    /// False whenever any part of the counts was locally estimated rather
    /// than provider-reported.
    pub is_reliable: bool,
    pub finish_reason: FinishReason,
    pub segment_count: u32,
    pub cost: CostBreakdown,
    pub preprocess_ms: u64,
    pub reasoning_ms: u64,
    pub first_response_ms: u64,
    pub postprocess_ms: u64,
    pub total_ms: u64,
}

/// Wraps one request's segment stream with balance enforcement, timing
/// milestones and final usage reconciliation. The consuming loop calls
/// `observe` per segment and must end with exactly one `finalize`, which is
/// enforced by `finalize` taking `self`.
pub struct ChatMeter {
    started: Instant,
    preprocess_at: Instant,
    first_reasoning_at: Option<Instant>,
    first_response_at: Option<Instant>,
    stream_end_at: Option<Instant>,
    segments: Vec<ChatSegment>,
    since_usage: Vec<ChatSegment>,
    last_reliable_usage: Option<TokenUsage>,
    finish_reason: FinishReason,
    segment_count: u32,
    calc: BalanceCalculator,
    price: PriceConfig,
}

impl ChatMeter {
    /// Performs the fail-fast sufficiency probe (one unit of input) before any
    /// upstream cost is incurred.
    pub fn begin(
        started: Instant,
        mut calc: BalanceCalculator,
        price: PriceConfig,
    ) -> Result<Self, ChatServiceError> {
        if !calc.is_sufficient() {
            return Err(ChatServiceError::insufficient_balance());
        }
        calc.set_cost(1, 0, 0, &price);
        if !calc.is_sufficient() {
            return Err(ChatServiceError::insufficient_balance());
        }
        Ok(Self {
            started,
            preprocess_at: Instant::now(),
            first_reasoning_at: None,
            first_response_at: None,
            stream_end_at: None,
            segments: Vec::new(),
            since_usage: Vec::new(),
            last_reliable_usage: None,
            finish_reason: FinishReason::Success,
            segment_count: 0,
            calc,
            price,
        })
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    pub fn set_finish_reason(&mut self, reason: FinishReason) {
        self.finish_reason = reason;
    }

    /// Merged view of everything seen so far — the snapshot serialized for
    /// non-streaming responses and cache persistence.
    pub fn snapshot(&self) -> &[ChatSegment] {
        &self.segments
    }

    pub fn last_reliable_usage(&self) -> Option<TokenUsage> {
        self.last_reliable_usage
    }

    /// Routes one segment. Usage segments re-price the request and abort with
    /// `InsufficientBalance` when the balance no longer covers it; all other
    /// segments are merged into the output and side buffers.
    pub fn observe(&mut self, segment: &ChatSegment) -> Result<(), ChatServiceError> {
        match segment {
            ChatSegment::Finish { finish_reason } => {
                if let Some(reason) = finish_reason {
                    self.finish_reason = *reason;
                }
            }
            ChatSegment::Usage { usage } => {
                // Record the reported counts before the sufficiency check so
                // an abort still bills what the provider said, not a local
                // estimate.
                self.last_reliable_usage = Some(*usage);
                self.since_usage.clear();
                self.calc.set_cost(
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cache_tokens,
                    &self.price,
                );
                if !self.calc.is_sufficient() {
                    self.finish_reason = FinishReason::InsufficientBalance;
                    return Err(ChatServiceError::insufficient_balance());
                }
            }
            other => {
                if matches!(other, ChatSegment::Think { .. }) && self.first_reasoning_at.is_none() {
                    self.first_reasoning_at = Some(Instant::now());
                }
                if other.is_response_content() {
                    if self.first_response_at.is_none() {
                        self.first_response_at = Some(Instant::now());
                    }
                    self.segment_count += 1;
                }
                add_merged(&mut self.segments, other.clone());
                add_merged(&mut self.since_usage, other.clone());
            }
        }
        Ok(())
    }

    pub fn mark_stream_end(&mut self) {
        if self.stream_end_at.is_none() {
            self.stream_end_at = Some(Instant::now());
        }
    }

    /// Reconciles final usage, runs the last sufficiency check and produces
    /// the one usage record for this request. Billing is forward-looking
    /// only: content already streamed is never taken back, but an
    /// insufficiency discovered here still flips the finish reason.
    pub fn finalize(mut self, request: &ChatRequest) -> UsageRecord {
        self.mark_stream_end();
        let (usage, is_reliable) = self.reconcile_usage(request);

        self.calc.set_cost(
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_tokens,
            &self.price,
        );
        if !self.calc.is_sufficient() {
            self.finish_reason = FinishReason::InsufficientBalance;
        }

        let finalize_at = Instant::now();
        let stream_end_at = self.stream_end_at.unwrap_or(finalize_at);
        let first_response_mark = self
            .first_reasoning_at
            .or(self.first_response_at)
            .unwrap_or(stream_end_at);
        let reasoning_ms = match (self.first_reasoning_at, self.first_response_at) {
            (Some(reasoning), Some(response)) => {
                response.duration_since(reasoning).as_millis() as u64
            }
            _ => 0,
        };

        UsageRecord {
            usage,
            is_reliable,
            finish_reason: self.finish_reason,
            segment_count: self.segment_count,
            cost: self.calc.cost,
            preprocess_ms: self
                .preprocess_at
                .duration_since(self.started)
                .as_millis() as u64,
            reasoning_ms,
            first_response_ms: first_response_mark
                .duration_since(self.preprocess_at)
                .as_millis() as u64,
            postprocess_ms: finalize_at.duration_since(stream_end_at).as_millis() as u64,
            total_ms: finalize_at.duration_since(self.started).as_millis() as u64,
        }
    }

    fn reconcile_usage(&self, request: &ChatRequest) -> (TokenUsage, bool) {
        let (extra_output, extra_reasoning) = tokenizer::estimate_output_tokens(&self.since_usage);

        match self.last_reliable_usage {
            Some(base) => {
                if extra_output == 0 {
                    (base, true)
                } else {
                    // Provider reported usage mid-stream and kept emitting:
                    // top up with estimated counts and mark unreliable.
                    (
                        TokenUsage {
                            input_tokens: base.input_tokens,
                            output_tokens: base.output_tokens + extra_output,
                            reasoning_tokens: base.reasoning_tokens + extra_reasoning,
                            cache_tokens: base.cache_tokens,
                            cache_creation_tokens: base.cache_creation_tokens,
                        },
                        false,
                    )
                }
            }
            None => (
                TokenUsage {
                    input_tokens: tokenizer::estimate_prompt_tokens(request),
                    output_tokens: extra_output,
                    reasoning_tokens: extra_reasoning,
                    cache_tokens: 0,
                    cache_creation_tokens: 0,
                },
                false,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatConfig, NeutralMessage};
    use rust_decimal::Decimal;

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![NeutralMessage::user_text("hello")],
            system: None,
            config: ChatConfig {
                model: "m".into(),
                ..Default::default()
            },
            tools: Vec::new(),
            streamed: true,
            top_p: None,
            seed: None,
            end_user_id: None,
        }
    }

    fn price() -> PriceConfig {
        PriceConfig {
            input_price: Decimal::new(1, 6),  // 0.000001 per token
            output_price: Decimal::new(2, 6), // 0.000002 per token
            cached_price: Decimal::new(5, 7),
        }
    }

    fn meter_with_balance(balance: Decimal) -> ChatMeter {
        ChatMeter::begin(
            Instant::now(),
            BalanceCalculator::new(balance, ModelGrant::default()),
            price(),
        )
        .expect("sufficient")
    }

    #[test]
    fn rejects_before_any_segment_when_balance_is_empty() {
        let err = ChatMeter::begin(
            Instant::now(),
            BalanceCalculator::new(Decimal::ZERO, ModelGrant::default()),
            price(),
        )
        .err()
        .expect("should fail fast");
        assert_eq!(err.finish_reason, FinishReason::InsufficientBalance);
    }

    #[test]
    fn free_model_passes_probe_with_zero_balance() {
        let free = PriceConfig::default();
        assert!(free.is_free());
        let meter = ChatMeter::begin(
            Instant::now(),
            BalanceCalculator::new(Decimal::ZERO, ModelGrant::default()),
            free,
        );
        assert!(meter.is_ok());
    }

    #[test]
    fn repeated_set_cost_is_monotonic_for_growing_usage() {
        let mut calc = BalanceCalculator::new(Decimal::new(100, 0), ModelGrant::default());
        let p = price();
        let mut last = Decimal::ZERO;
        for (input, output) in [(10u64, 0u64), (10, 5), (100, 5), (100, 50), (200, 300)] {
            calc.set_cost(input, output, 0, &p);
            let total = calc.cost().total_cost();
            assert!(total >= last, "cost decreased at ({input},{output})");
            last = total;
        }
    }

    #[test]
    fn count_grant_covers_a_whole_call() {
        let mut calc = BalanceCalculator::new(Decimal::ZERO, ModelGrant { counts: 2, tokens: 0 });
        calc.set_cost(10_000, 10_000, 0, &price());
        assert!(calc.is_sufficient());
        assert_eq!(calc.cost().counts_used, 1);
        assert_eq!(calc.cost().total_cost(), Decimal::ZERO);
    }

    #[test]
    fn token_grant_covers_output_before_input() {
        let mut calc = BalanceCalculator::new(
            Decimal::new(1, 0),
            ModelGrant {
                counts: 0,
                tokens: 250,
            },
        );
        let p = price();
        // output 200 fits in the grant, leaving 50 for input 100.
        calc.set_cost(100, 200, 0, &p);
        assert_eq!(calc.cost().output_cost, Decimal::ZERO);
        assert_eq!(calc.cost().input_cost, p.input_price * Decimal::from(50));
        assert_eq!(calc.cost().tokens_used, 250);
    }

    #[test]
    fn reliable_usage_alone_stays_reliable() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter
            .observe(&ChatSegment::from_text("hi"))
            .expect("balance ok");
        meter
            .observe(&ChatSegment::from_usage(TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                ..Default::default()
            }))
            .expect("balance ok");
        let record = meter.finalize(&request());
        assert!(record.is_reliable);
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.usage.output_tokens, 20);
    }

    #[test]
    fn content_after_reliable_usage_is_estimated_and_marked_unreliable() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter
            .observe(&ChatSegment::from_usage(TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                ..Default::default()
            }))
            .expect("balance ok");
        meter
            .observe(&ChatSegment::from_text("tail one"))
            .expect("balance ok");
        meter
            .observe(&ChatSegment::from_text(" and two"))
            .expect("balance ok");
        let expected_extra = tokenizer::count_tokens("tail one and two");
        let record = meter.finalize(&request());
        assert!(!record.is_reliable);
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.usage.output_tokens, 20 + expected_extra);
    }

    #[test]
    fn no_reported_usage_estimates_everything() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter
            .observe(&ChatSegment::from_think("pondering"))
            .expect("balance ok");
        meter
            .observe(&ChatSegment::from_text("answer"))
            .expect("balance ok");
        let record = meter.finalize(&request());
        assert!(!record.is_reliable);
        assert!(record.usage.input_tokens > 0);
        assert_eq!(
            record.usage.output_tokens,
            tokenizer::count_tokens("pondering") + tokenizer::count_tokens("answer")
        );
        assert_eq!(
            record.usage.reasoning_tokens,
            tokenizer::count_tokens("pondering")
        );
    }

    #[test]
    fn tool_call_segments_after_usage_do_not_contribute_to_estimate() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter
            .observe(&ChatSegment::from_usage(TokenUsage {
                input_tokens: 50,
                output_tokens: 10,
                ..Default::default()
            }))
            .expect("balance ok");
        meter
            .observe(&ChatSegment::ToolCall {
                index: 0,
                id: Some("call".into()),
                name: Some("f".into()),
                arguments: "{\"x\": 1}".into(),
            })
            .expect("balance ok");
        let record = meter.finalize(&request());
        assert!(record.is_reliable);
        assert_eq!(record.usage.output_tokens, 10);
    }

    #[test]
    fn mid_stream_usage_beyond_balance_aborts() {
        let mut meter = meter_with_balance(Decimal::new(1, 4)); // 0.0001
        let err = meter
            .observe(&ChatSegment::from_usage(TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
                ..Default::default()
            }))
            .err()
            .expect("should abort");
        assert_eq!(err.finish_reason, FinishReason::InsufficientBalance);
        assert_eq!(meter.finish_reason(), FinishReason::InsufficientBalance);
        // The billing path still completes, and it bills the counts the
        // provider reported, not a local estimate.
        let record = meter.finalize(&request());
        assert_eq!(record.finish_reason, FinishReason::InsufficientBalance);
        assert!(record.is_reliable);
        assert_eq!(record.usage.input_tokens, 1_000_000);
        assert_eq!(record.usage.output_tokens, 1_000_000);
        let p = price();
        assert_eq!(
            record.cost.total_cost(),
            (p.input_price + p.output_price) * Decimal::from(1_000_000)
        );
    }

    #[test]
    fn finish_reason_last_non_null_wins() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter
            .observe(&ChatSegment::from_finish_reason(Some(FinishReason::Stop)))
            .expect("ok");
        meter
            .observe(&ChatSegment::from_finish_reason(None))
            .expect("ok");
        assert_eq!(meter.finish_reason(), FinishReason::Stop);
        meter
            .observe(&ChatSegment::from_finish_reason(Some(
                FinishReason::ToolCalls,
            )))
            .expect("ok");
        assert_eq!(meter.finish_reason(), FinishReason::ToolCalls);
    }

    #[test]
    fn snapshot_is_merged() {
        let mut meter = meter_with_balance(Decimal::new(10, 0));
        meter.observe(&ChatSegment::from_text("a")).expect("ok");
        meter.observe(&ChatSegment::from_text("b")).expect("ok");
        assert_eq!(meter.snapshot(), &[ChatSegment::from_text("ab")]);
    }
}
