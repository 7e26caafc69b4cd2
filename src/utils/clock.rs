//! 时钟与挂起点
//!
//! 限流窗口按墙上时间（分钟整点、本地零点）划分，等待则通过 `Clock::sleep`
//! 完成。生产环境用 `SystemClock`，测试用 `ManualClock` 立即推进时间。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

/// 时钟抽象
#[async_trait]
pub trait Clock: Send + Sync {
    /// 当前墙上时间（本地时区，无时区信息）
    fn now(&self) -> NaiveDateTime;

    /// 挂起当前任务 `duration` 时长
    async fn sleep(&self, duration: Duration);
}

/// 真实时钟：`chrono::Local` + `tokio::time::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 手动时钟
///
/// `sleep` 不真正等待，只把时间向前推进，并记录每次挂起的时长。
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// 推进时间（不计入挂起记录）
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += to_chrono(duration);
    }

    /// 所有 `sleep` 调用的时长
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 累计挂起时长
    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// 自 `started` 起经过的时长（时钟回拨时为零）
pub fn elapsed_since(clock: &dyn Clock, started: NaiveDateTime) -> Duration {
    (clock.now() - started).to_std().unwrap_or_default()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_advances_time() {
        let clock = ManualClock::new(at(9, 0, 0));
        clock.sleep(Duration::from_secs(90)).await;
        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now(), at(9, 1, 40));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(90)]);
        assert_eq!(clock.total_slept(), Duration::from_secs(90));
    }
}
