//! 限流器 - 业务能力层
//!
//! 两个调用方（agent1 检测 / agent2 验证）共用一个合并额度，
//! 按墙上时间的分钟桶和自然日桶计数：
//!
//! - 每次检查前先做边界翻转（跨过分钟整点 / 本地零点则清零）
//! - 单调用方上限和合并上限都有余量才放行，合并上限始终生效
//! - 不放行时给出到最近可释放额度的边界的等待时长
//! - 只有被接受的请求才计数（`record_call`）
//!
//! 状态是显式持有的 `RateLimitState`，由调用方构造并注入，
//! 没有全局单例；所有方法都取 `&mut self`，并发访问在编译期就被排除。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::QuotaWindow;
use crate::utils::clock::Clock;

/// 单调用方的可选上限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerLimits {
    pub rpm: Option<u32>,
    pub rpd: Option<u32>,
}

/// 限流配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    combined_rpm: u32,
    combined_rpd: u32,
    callers: HashMap<String, CallerLimits>,
}

impl RateLimits {
    pub fn new(combined_rpm: u32, combined_rpd: u32) -> Self {
        Self {
            combined_rpm,
            combined_rpd,
            callers: HashMap::new(),
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>, limits: CallerLimits) -> Self {
        self.callers.insert(caller.into(), limits);
        self
    }

    pub fn caller(&self, caller: &str) -> CallerLimits {
        self.callers.get(caller).copied().unwrap_or_default()
    }

    /// 实际生效的合并每分钟上限
    ///
    /// 所有已登记的调用方都声明了上限时，取 min(合并上限, 各调用方上限之和)。
    pub fn effective_rpm(&self) -> u32 {
        self.effective(self.combined_rpm, |l| l.rpm)
    }

    /// 实际生效的合并每日上限
    pub fn effective_rpd(&self) -> u32 {
        self.effective(self.combined_rpd, |l| l.rpd)
    }

    fn effective(&self, combined: u32, pick: impl Fn(&CallerLimits) -> Option<u32>) -> u32 {
        if self.callers.is_empty() {
            return combined;
        }
        let sum = self
            .callers
            .values()
            .map(&pick)
            .try_fold(0u32, |acc, limit| limit.map(|l| acc.saturating_add(l)));
        match sum {
            Some(sum) => sum.min(combined),
            None => combined,
        }
    }
}

/// 一个调用方（或合并额度）的计数窗口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    minute_start: NaiveDateTime,
    minute_count: u32,
    day_start: NaiveDateTime,
    day_count: u32,
}

impl RateLimitWindow {
    /// 计数为零，边界取 `now` 所在的分钟和自然日
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            minute_start: floor_minute(now),
            minute_count: 0,
            day_start: floor_day(now),
            day_count: 0,
        }
    }

    /// 边界翻转：只在 `now` 跨过桶边界时整体清零
    pub fn roll_over(&mut self, now: NaiveDateTime) {
        let minute = floor_minute(now);
        if minute > self.minute_start {
            self.minute_start = minute;
            self.minute_count = 0;
        }
        let day = floor_day(now);
        if day > self.day_start {
            self.day_start = day;
            self.day_count = 0;
        }
    }

    fn record(&mut self) {
        self.minute_count += 1;
        self.day_count += 1;
    }

    pub fn minute_count(&self) -> u32 {
        self.minute_count
    }

    pub fn day_count(&self) -> u32 {
        self.day_count
    }

    pub fn next_minute_boundary(&self) -> NaiveDateTime {
        self.minute_start + chrono::Duration::minutes(1)
    }

    pub fn next_day_boundary(&self) -> NaiveDateTime {
        self.day_start + chrono::Duration::days(1)
    }
}

/// 进程级限流状态
#[derive(Debug, Clone)]
pub struct RateLimitState {
    combined: RateLimitWindow,
    callers: HashMap<String, RateLimitWindow>,
}

impl RateLimitState {
    /// 启动时初始化：所有计数为零，边界取当前时间
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            combined: RateLimitWindow::new(now),
            callers: HashMap::new(),
        }
    }

    fn roll_over(&mut self, now: NaiveDateTime) {
        self.combined.roll_over(now);
        for window in self.callers.values_mut() {
            window.roll_over(now);
        }
    }

    fn caller_window(&mut self, caller: &str, now: NaiveDateTime) -> &mut RateLimitWindow {
        self.callers
            .entry(caller.to_string())
            .or_insert_with(|| RateLimitWindow::new(now))
    }

    pub fn combined(&self) -> &RateLimitWindow {
        &self.combined
    }

    pub fn caller(&self, caller: &str) -> Option<&RateLimitWindow> {
        self.callers.get(caller)
    }
}

/// `may_call` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// 可以立即发出请求
    Allowed,
    /// 需要等待；`window == Day` 表示当天额度耗尽
    Wait { wait: Duration, window: QuotaWindow },
}

impl CallPermit {
    pub fn allowed(&self) -> bool {
        matches!(self, CallPermit::Allowed)
    }

    pub fn wait_seconds(&self) -> f64 {
        match self {
            CallPermit::Allowed => 0.0,
            CallPermit::Wait { wait, .. } => wait.as_secs_f64(),
        }
    }
}

/// 用量快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub rpm_used: u32,
    pub rpm_limit: u32,
    pub rpd_used: u32,
    pub rpd_limit: u32,
    pub by_caller: BTreeMap<String, CallerUsage>,
}

impl UsageSummary {
    pub fn rpd_remaining(&self) -> u32 {
        self.rpd_limit.saturating_sub(self.rpd_used)
    }

    pub fn rpm_remaining(&self) -> u32 {
        self.rpm_limit.saturating_sub(self.rpm_used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallerUsage {
    pub rpm_used: u32,
    pub rpd_used: u32,
}

/// 限流器
pub struct RateLimiter {
    limits: RateLimits,
    state: RateLimitState,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, state: RateLimitState, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            state,
            clock,
        }
    }

    /// 以时钟当前时间初始化状态
    pub fn starting_now(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        let state = RateLimitState::new(clock.now());
        Self::new(limits, state, clock)
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn state(&self) -> &RateLimitState {
        &self.state
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 判断调用方现在能否发出请求
    pub fn may_call(&mut self, caller: &str) -> CallPermit {
        let now = self.clock.now();
        self.state.roll_over(now);

        let caller_limits = self.limits.caller(caller);
        let rpm_limit = self.limits.effective_rpm();
        let rpd_limit = self.limits.effective_rpd();

        let combined = self.state.combined.clone();
        let own = self.state.caller_window(caller, now).clone();

        let day_full = combined.day_count >= rpd_limit
            || caller_limits.rpd.is_some_and(|l| own.day_count >= l);
        if day_full {
            let wait = until(now, combined.next_day_boundary());
            debug!("{} 当日额度耗尽, {:?} 后重置", caller, wait);
            return CallPermit::Wait {
                wait,
                window: QuotaWindow::Day,
            };
        }

        let minute_full = combined.minute_count >= rpm_limit
            || caller_limits.rpm.is_some_and(|l| own.minute_count >= l);
        if minute_full {
            let wait = until(now, combined.next_minute_boundary());
            debug!(
                "{} 分钟额度已满 ({}/{} RPM), 需等待 {:?}",
                caller, combined.minute_count, rpm_limit, wait
            );
            return CallPermit::Wait {
                wait,
                window: QuotaWindow::Minute,
            };
        }

        CallPermit::Allowed
    }

    /// 登记一次已被接受的请求
    ///
    /// 必须紧跟在 `may_call` 返回 `Allowed` 之后、发出网络请求之前调用。
    pub fn record_call(&mut self, caller: &str) {
        let now = self.clock.now();
        self.state.roll_over(now);
        self.state.combined.record();
        self.state.caller_window(caller, now).record();

        info!(
            "📊 合并用量: {}/{} RPM, {}/{} RPD ({} 今日 {} 次)",
            self.state.combined.minute_count,
            self.limits.effective_rpm(),
            self.state.combined.day_count,
            self.limits.effective_rpd(),
            caller,
            self.state.callers.get(caller).map_or(0, |w| w.day_count)
        );
    }

    /// 当前窗口的用量
    pub fn usage_summary(&mut self) -> UsageSummary {
        let now = self.clock.now();
        self.state.roll_over(now);

        let by_caller = self
            .state
            .callers
            .iter()
            .map(|(name, w)| {
                (
                    name.clone(),
                    CallerUsage {
                        rpm_used: w.minute_count,
                        rpd_used: w.day_count,
                    },
                )
            })
            .collect();

        UsageSummary {
            rpm_used: self.state.combined.minute_count,
            rpm_limit: self.limits.effective_rpm(),
            rpd_used: self.state.combined.day_count,
            rpd_limit: self.limits.effective_rpd(),
            by_caller,
        }
    }

    /// 距下一个本地零点的时长
    pub fn until_day_reset(&self) -> Duration {
        until(self.clock.now(), self.state.combined.next_day_boundary())
    }
}

fn until(now: NaiveDateTime, boundary: NaiveDateTime) -> Duration {
    (boundary - now).to_std().unwrap_or(Duration::ZERO)
}

fn floor_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_time(NaiveTime::MIN)
        + chrono::Duration::hours(i64::from(t.hour()))
        + chrono::Duration::minutes(i64::from(t.minute()))
}

fn floor_day(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_time(NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn limiter(limits: RateLimits, start: NaiveDateTime) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::starting_now(limits, clock.clone());
        (limiter, clock)
    }

    fn take(limiter: &mut RateLimiter, caller: &str) -> CallPermit {
        let permit = limiter.may_call(caller);
        if permit.allowed() {
            limiter.record_call(caller);
        }
        permit
    }

    #[test]
    fn test_window_rolls_over_only_at_boundary() {
        let mut window = RateLimitWindow::new(at(10, 15, 42));
        window.record();
        window.record();

        window.roll_over(at(10, 15, 59));
        assert_eq!(window.minute_count(), 2);

        window.roll_over(at(10, 16, 0));
        assert_eq!(window.minute_count(), 0);
        assert_eq!(window.day_count(), 2);
        assert_eq!(window.next_minute_boundary(), at(10, 17, 0));
    }

    #[test]
    fn test_minute_exhaustion_waits_until_next_minute() {
        let (mut limiter, _clock) = limiter(RateLimits::new(2, 100), at(8, 0, 20));

        assert!(take(&mut limiter, "agent1").allowed());
        assert!(take(&mut limiter, "agent2").allowed());

        let permit = limiter.may_call("agent1");
        assert_eq!(
            permit,
            CallPermit::Wait {
                wait: Duration::from_secs(40),
                window: QuotaWindow::Minute
            }
        );
        assert_eq!(permit.wait_seconds(), 40.0);
    }

    #[test]
    fn test_rejected_checks_do_not_consume_budget() {
        let (mut limiter, clock) = limiter(RateLimits::new(1, 100), at(8, 0, 0));
        assert!(take(&mut limiter, "agent1").allowed());
        for _ in 0..5 {
            assert!(!limiter.may_call("agent1").allowed());
        }
        clock.advance(Duration::from_secs(60));
        assert!(take(&mut limiter, "agent1").allowed());
        assert_eq!(limiter.usage_summary().rpd_used, 2);
    }

    #[test]
    fn test_combined_budget_binds_even_when_caller_has_headroom() {
        let limits = RateLimits::new(3, 100).with_caller(
            "agent2",
            CallerLimits {
                rpm: Some(10),
                rpd: None,
            },
        );
        let (mut limiter, _clock) = limiter(limits, at(9, 30, 0));

        for _ in 0..3 {
            assert!(take(&mut limiter, "agent1").allowed());
        }
        assert!(matches!(
            limiter.may_call("agent2"),
            CallPermit::Wait {
                window: QuotaWindow::Minute,
                ..
            }
        ));
    }

    #[test]
    fn test_per_caller_ceiling_blocks_only_that_caller() {
        let limits = RateLimits::new(10, 100).with_caller(
            "agent1",
            CallerLimits {
                rpm: Some(1),
                rpd: None,
            },
        );
        let (mut limiter, _clock) = limiter(limits, at(9, 30, 0));

        assert!(take(&mut limiter, "agent1").allowed());
        assert!(!limiter.may_call("agent1").allowed());
        assert!(limiter.may_call("agent2").allowed());
    }

    #[test]
    fn test_day_exhaustion_is_reported_as_day_window() {
        let (mut limiter, clock) = limiter(RateLimits::new(10, 3), at(23, 0, 0));
        for _ in 0..3 {
            assert!(take(&mut limiter, "agent1").allowed());
            clock.advance(Duration::from_secs(61));
        }

        match limiter.may_call("agent2") {
            CallPermit::Wait { wait, window } => {
                assert_eq!(window, QuotaWindow::Day);
                assert_eq!(wait, limiter.until_day_reset());
                assert!(wait > Duration::from_secs(50 * 60));
            }
            other => panic!("应当被拒绝: {:?}", other),
        }

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.may_call("agent2").allowed());
        assert_eq!(limiter.usage_summary().rpd_used, 0);
    }

    #[test]
    fn test_effective_ceiling_uses_sum_of_caller_limits() {
        let limits = RateLimits::new(10, 200)
            .with_caller(
                "agent1",
                CallerLimits {
                    rpm: Some(3),
                    rpd: Some(500),
                },
            )
            .with_caller(
                "agent2",
                CallerLimits {
                    rpm: Some(4),
                    rpd: None,
                },
            );
        assert_eq!(limits.effective_rpm(), 7);
        assert_eq!(limits.effective_rpd(), 200);
    }

    #[test]
    fn test_usage_summary_tracks_callers() {
        let (mut limiter, _clock) = limiter(RateLimits::new(10, 200), at(12, 0, 0));
        take(&mut limiter, "agent1");
        take(&mut limiter, "agent2");
        take(&mut limiter, "agent1");

        let usage = limiter.usage_summary();
        assert_eq!(usage.rpm_used, 3);
        assert_eq!(usage.rpd_remaining(), 197);
        assert_eq!(usage.by_caller["agent1"].rpd_used, 2);
        assert_eq!(usage.by_caller["agent2"].rpm_used, 1);
    }

    proptest! {
        #[test]
        fn prop_windows_never_exceed_ceilings(
            steps in proptest::collection::vec((0usize..2, 0u64..45), 1..300),
            rpm in 1u32..12,
            rpd in 1u32..60,
            caller_rpm in proptest::option::of(1u32..8),
            caller_rpd in proptest::option::of(1u32..30),
        ) {
            let limits = RateLimits::new(rpm, rpd)
                .with_caller("agent1", CallerLimits { rpm: caller_rpm, rpd: caller_rpd })
                .with_caller("agent2", CallerLimits::default());
            let (mut limiter, clock) = limiter(limits, at(22, 30, 0));
            let callers = ["agent1", "agent2"];

            for (idx, advance) in steps {
                clock.advance(Duration::from_secs(advance));
                take(&mut limiter, callers[idx]);

                let usage = limiter.usage_summary();
                prop_assert!(usage.rpm_used <= rpm);
                prop_assert!(usage.rpd_used <= rpd);
                if let Some(own) = usage.by_caller.get("agent1") {
                    if let Some(limit) = caller_rpm {
                        prop_assert!(own.rpm_used <= limit);
                    }
                    if let Some(limit) = caller_rpd {
                        prop_assert!(own.rpd_used <= limit);
                    }
                }
                let per_caller_total: u32 = usage.by_caller.values().map(|c| c.rpm_used).sum();
                prop_assert_eq!(per_caller_total, usage.rpm_used);
            }
        }
    }
}
