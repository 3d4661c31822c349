//! 重试策略：指数退避 + 可选抖动，按错误消息判断是否为瞬时错误

use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use regex::RegexSet;
use serde::Deserialize;

/// 瞬时错误特征：连接重置/超时/拒绝、DNS、资源忙、权限竞争、限流、HTTP 502/503/504
const TRANSIENT_PATTERNS: &[&str] = &[
    r"econnreset|connection reset",
    r"\betimedout\b|\btimed out\b",
    r"\b(?:connect|connection|request|read|write|socket|network|operation)\s+timeout\b",
    r"\btimeout\s+(?:error|exceeded|expired|elapsed)\b",
    r"econnrefused|connection refused",
    r"\benotfound\b|\beai_again\b|\bgetaddrinfo\b|\bdns\b",
    r"ebusy|resource busy",
    r"\beperm\b",
    r"rate limit",
    r"too many requests",
    r"\b50[234]\b|bad gateway|service unavailable|gateway timeout",
];

fn transient_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        let patterns = TRANSIENT_PATTERNS.iter().map(|p| format!("(?i){p}"));
        RegexSet::new(patterns).expect("valid regex")
    })
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// 抖动比例（0.0 ~ 1.0），0 表示不抖动
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 第 attempt 次重试前的等待（从 0 计）：min(base × mult^attempt ± jitter, max)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let p = &self.policy;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let cap = p.max_delay_ms as f64;
        let raw = p.base_delay_ms as f64 * p.backoff_multiplier.powi(exp);
        // 先封顶再加抖动；inf 封顶为 cap，0 × inf 得到的 NaN 视为 0
        let mut delay = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, cap) };
        let jitter = p.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 && delay > 0.0 {
            let spread = delay * jitter;
            delay += rand::thread_rng().gen_range(-spread..=spread);
        }
        Duration::from_millis(delay.clamp(0.0, cap) as u64)
    }

    /// 只有命中瞬时错误特征的消息才可重试（如参数格式错误永远不重试）
    pub fn is_retryable(&self, error: &str) -> bool {
        transient_set().is_match(error)
    }

    /// attempt 为已完成的重试次数（从 0 计）
    pub fn should_retry(&self, attempt: u32, max_retries: u32, error: &str) -> bool {
        attempt < max_retries && self.is_retryable(error)
    }
}
