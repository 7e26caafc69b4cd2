//! 外部调用服务 - 业务能力层
//!
//! 只负责"把一个请求安全地送到推理 API"：
//! 1. 每次尝试前向限流器申请额度，分钟额度不足就挂起等待，当日额度耗尽立即失败
//! 2. 登记额度后再发请求，请求有超时上限
//! 3. 瞬时错误指数退避重试，达到上限后返回 `ApiError::Transient`
//! 4. 非瞬时错误（认证、请求格式）直接返回，不重试

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clients::{InferenceApi, InferenceError, InferenceRequest};
use crate::error::{ApiError, QuotaWindow};
use crate::services::rate_limiter::{CallPermit, RateLimiter};
use crate::utils::clock::Clock;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时长：base * 2^(attempt-1)，不超过 max_backoff
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// 一次成功调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub text: String,
    pub model: String,
    /// 实际发出的请求数（每次都已计入额度）
    pub attempts: u32,
}

/// 外部调用服务
pub struct ExternalCaller {
    api: Arc<dyn InferenceApi>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ExternalCaller {
    pub fn new(
        api: Arc<dyn InferenceApi>,
        limiter: RateLimiter,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            limiter,
            policy,
            timeout,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.limiter.clock().clone()
    }

    /// 发送请求（带限流、超时和重试）
    pub async fn call(
        &mut self,
        caller: &str,
        request: &InferenceRequest,
    ) -> Result<CallResponse, ApiError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.acquire(caller).await?;

            info!(
                "🔄 {}: 发送请求到 {} (第 {}/{} 次)...",
                caller, request.model, attempt, self.policy.max_attempts
            );

            let result = match tokio::time::timeout(self.timeout, self.api.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout),
            };

            match result {
                Ok(text) => {
                    info!("✅ {}: 响应接收成功 ({} 字符)", caller, text.len());
                    return Ok(CallResponse {
                        text,
                        model: request.model.clone(),
                        attempts: attempt,
                    });
                }
                Err(err) if !err.is_transient() => {
                    warn!("❌ {}: 不可重试的错误: {}", caller, err);
                    return Err(ApiError::NonTransient {
                        caller: caller.to_string(),
                        model: request.model.clone(),
                        source: err,
                    });
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    warn!("❌ {}: 已重试 {} 次仍失败: {}", caller, attempt, err);
                    return Err(ApiError::Transient {
                        caller: caller.to_string(),
                        model: request.model.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let mut delay = self.policy.backoff_for(attempt);
                    if let InferenceError::RateLimitedByServer {
                        retry_after: Some(retry_after),
                    } = &err
                    {
                        delay = delay.max(*retry_after);
                    }
                    warn!(
                        "⚠️ {}: 第 {} 次请求失败: {}, {:?} 后重试",
                        caller, attempt, err, delay
                    );
                    self.clock().sleep(delay).await;
                }
            }
        }
    }

    /// 申请一次额度：分钟额度不足则挂起到下个分钟边界再查，当日额度耗尽立即失败
    async fn acquire(&mut self, caller: &str) -> Result<(), ApiError> {
        loop {
            match self.limiter.may_call(caller) {
                CallPermit::Allowed => {
                    self.limiter.record_call(caller);
                    return Ok(());
                }
                CallPermit::Wait {
                    wait,
                    window: QuotaWindow::Day,
                } => {
                    warn!(
                        "⚠️ 每日合并额度已用完 ({} 次), {:.1} 小时后重置",
                        self.limiter.limits().effective_rpd(),
                        wait.as_secs_f64() / 3600.0
                    );
                    return Err(ApiError::QuotaExhausted {
                        caller: caller.to_string(),
                        window: QuotaWindow::Day,
                        resets_in: wait,
                    });
                }
                CallPermit::Wait {
                    wait,
                    window: QuotaWindow::Minute,
                } => {
                    info!("⏳ 合并限流: {} 等待 {:.1}s", caller, wait.as_secs_f64());
                    self.clock().sleep(wait).await;
                    debug!("{} 等待结束，重新检查额度", caller);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limiter::RateLimits;
    use crate::utils::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    struct FakeApi {
        replies: Mutex<VecDeque<Result<String, InferenceError>>>,
        calls: AtomicU32,
    }

    impl FakeApi {
        fn new(replies: Vec<Result<String, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceApi for FakeApi {
        async fn send(&self, _request: &InferenceRequest) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    struct SlowApi;

    #[async_trait]
    impl InferenceApi for SlowApi {
        async fn send(&self, _request: &InferenceRequest) -> Result<String, InferenceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        }
    }

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn caller_with(
        api: Arc<dyn InferenceApi>,
        limits: RateLimits,
        max_attempts: u32,
    ) -> (ExternalCaller, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = RateLimiter::starting_now(limits, clock.clone());
        let policy = RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        };
        (
            ExternalCaller::new(api, limiter, policy, Duration::from_secs(5)),
            clock,
        )
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("gemini-2.0-flash", "prompt")
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(20),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(20));
        assert_eq!(policy.backoff_for(64), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_with_backoff() {
        let api = FakeApi::new(vec![
            Err(InferenceError::Server {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Err(InferenceError::Transport("reset".to_string())),
            Ok("done".to_string()),
        ]);
        let (mut caller, clock) = caller_with(api.clone(), RateLimits::new(10, 100), 3);

        let response = assert_ok!(caller.call("agent1", &request()).await);
        assert_eq!(response.text, "done");
        assert_eq!(response.attempts, 3);
        assert_eq!(api.calls(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        // 每次尝试都计入额度
        assert_eq!(caller.limiter_mut().usage_summary().rpd_used, 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_surfaces_transient_error() {
        let api = FakeApi::new(vec![
            Err(InferenceError::Timeout),
            Err(InferenceError::Timeout),
            Err(InferenceError::Timeout),
            Ok("never".to_string()),
        ]);
        let (mut caller, _clock) = caller_with(api.clone(), RateLimits::new(10, 100), 2);

        let err = assert_err!(caller.call("agent2", &request()).await);
        assert!(matches!(
            err,
            ApiError::Transient {
                attempts: 2,
                source: InferenceError::Timeout,
                ..
            }
        ));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_immediately() {
        let api = FakeApi::new(vec![Err(InferenceError::Auth("invalid key".to_string()))]);
        let (mut caller, clock) = caller_with(api.clone(), RateLimits::new(10, 100), 5);

        let err = assert_err!(caller.call("agent1", &request()).await);
        assert!(matches!(err, ApiError::NonTransient { .. }));
        assert_eq!(api.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_server_retry_after_extends_backoff() {
        let api = FakeApi::new(vec![
            Err(InferenceError::RateLimitedByServer {
                retry_after: Some(Duration::from_secs(30)),
            }),
            Ok("ok".to_string()),
        ]);
        let (mut caller, clock) = caller_with(api, RateLimits::new(10, 100), 3);

        assert_ok!(caller.call("agent1", &request()).await);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_day_exhaustion_fails_fast_without_network_call() {
        let api = FakeApi::new(vec![]);
        let (mut caller, clock) = caller_with(api.clone(), RateLimits::new(10, 1), 3);

        assert_ok!(caller.call("agent1", &request()).await);
        let err = assert_err!(caller.call("agent2", &request()).await);

        assert!(err.is_daily_exhaustion());
        assert_eq!(api.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_transient() {
        let (mut caller, _clock) = caller_with(Arc::new(SlowApi), RateLimits::new(10, 100), 2);

        let err = assert_err!(caller.call("agent1", &request()).await);
        assert!(matches!(
            err,
            ApiError::Transient {
                attempts: 2,
                source: InferenceError::Timeout,
                ..
            }
        ));
    }
}
