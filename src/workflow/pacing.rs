//! 检测与验证之间的节奏控制
//!
//! 这里只给出建议等待时长；硬性限制始终由限流器执行。

use std::time::Duration;

use crate::services::UsageSummary;

/// 节奏策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingStrategy {
    /// 不等待
    None,
    /// 固定等待
    Fixed(Duration),
    /// max(min_delay, 60 秒 - 本分钟已用请求数)
    MinuteHeadroom { min_delay: Duration },
    /// 把今天剩余的请求均匀摊到零点之前，至少 min_delay
    SpreadDaily { min_delay: Duration },
}

impl PacingStrategy {
    /// 计算两次调用之间的等待时长
    pub fn delay(&self, usage: &UsageSummary, until_day_reset: Duration) -> Duration {
        match *self {
            PacingStrategy::None => Duration::ZERO,
            PacingStrategy::Fixed(delay) => delay,
            PacingStrategy::MinuteHeadroom { min_delay } => {
                let headroom = 60u64.saturating_sub(u64::from(usage.rpm_used));
                min_delay.max(Duration::from_secs(headroom))
            }
            PacingStrategy::SpreadDaily { min_delay } => match usage.rpd_remaining() {
                0 => min_delay,
                remaining => min_delay.max(until_day_reset / remaining),
            },
        }
    }
}

impl Default for PacingStrategy {
    fn default() -> Self {
        PacingStrategy::MinuteHeadroom {
            min_delay: Duration::from_secs(6),
        }
    }
}
