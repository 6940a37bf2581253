//! 同步进度管理
//!
//! 提供同步过程中的进度描述、速率计算和 ETA 估算。

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// 准备中
    Preparing,
    /// 拉取远端变更
    Pulling,
    /// 应用到本地
    Applying,
    /// 推送本地变更
    Pushing,
    /// 上传消息
    UploadingMessages,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl SyncPhase {
    /// 获取阶段的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            SyncPhase::Preparing => "准备中",
            SyncPhase::Pulling => "拉取中",
            SyncPhase::Applying => "应用变更",
            SyncPhase::Pushing => "推送中",
            SyncPhase::UploadingMessages => "上传消息",
            SyncPhase::Completed => "已完成",
            SyncPhase::Failed => "失败",
        }
    }

    /// 判断是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::Failed)
    }
}

/// 同步进度
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// 进度百分比 (0-100)
    pub percent: f32,
    pub current: u64,
    pub total: u64,
    /// 当前处理的条目
    pub current_item: Option<String>,
    /// 处理速率（条/秒）
    pub rate_per_sec: Option<u64>,
    /// 预计剩余时间（秒）
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
}

impl SyncProgress {
    fn new(phase: SyncPhase, percent: f32, current: u64, total: u64) -> Self {
        Self {
            phase,
            percent,
            current,
            total,
            current_item: None,
            rate_per_sec: None,
            eta_seconds: None,
            error: None,
        }
    }

    // 在 [from, from + span] 区间内按 current/total 插值
    fn scaled(phase: SyncPhase, from: f32, span: f32, current: u64, total: u64) -> Self {
        let percent = if total > 0 {
            from + (current.min(total) as f32 / total as f32) * span
        } else {
            from
        };
        Self::new(phase, percent, current, total)
    }

    pub fn preparing() -> Self {
        Self::new(SyncPhase::Preparing, 0.0, 0, 0)
    }

    pub fn pulling() -> Self {
        Self::new(SyncPhase::Pulling, 5.0, 0, 0)
    }

    /// 10% - 40%
    pub fn applying(current: u64, total: u64) -> Self {
        Self::scaled(SyncPhase::Applying, 10.0, 30.0, current, total)
    }

    /// 40% - 60%
    pub fn pushing(current: u64, total: u64) -> Self {
        Self::scaled(SyncPhase::Pushing, 40.0, 20.0, current, total)
    }

    /// 60% - 99%
    pub fn uploading_messages(current: u64, total: u64) -> Self {
        Self::scaled(SyncPhase::UploadingMessages, 60.0, 39.0, current, total)
    }

    pub fn completed() -> Self {
        Self::new(SyncPhase::Completed, 100.0, 0, 0)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut progress = Self::new(SyncPhase::Failed, 0.0, 0, 0);
        progress.error = Some(error.into());
        progress
    }

    pub fn with_current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    /// 设置速率和 ETA
    pub fn with_rate(mut self, rate_per_sec: u64, eta_seconds: Option<u64>) -> Self {
        self.rate_per_sec = Some(rate_per_sec);
        self.eta_seconds = eta_seconds;
        self
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent = percent.clamp(0.0, 100.0);
        self
    }
}

/// 速率计算器（滑动窗口）
pub struct SpeedCalculator {
    /// 采样数据：(时间点, 累计条数)
    samples: Vec<(Instant, u64)>,
    window_size: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Vec::with_capacity(window_size),
            window_size: window_size.max(2), // 至少需要 2 个点
        }
    }

    /// 默认窗口（10 个采样点）
    pub fn default_window() -> Self {
        Self::new(10)
    }

    pub fn add_sample(&mut self, count: u64) {
        self.add_sample_at(Instant::now(), count);
    }

    fn add_sample_at(&mut self, at: Instant, count: u64) {
        if self.samples.len() >= self.window_size {
            self.samples.remove(0);
        }
        self.samples.push((at, count));
    }

    /// 窗口内首尾采样的平均速率（条/秒）
    pub fn calculate_rate(&self) -> Option<u64> {
        let (first, last) = match (self.samples.first(), self.samples.last()) {
            (Some(f), Some(l)) if self.samples.len() >= 2 => (f, l),
            _ => return None,
        };
        let duration = last.0.duration_since(first.0);
        if duration.is_zero() {
            return None;
        }
        let diff = last.1.saturating_sub(first.1);
        Some((diff as f64 / duration.as_secs_f64()) as u64)
    }

    /// 预计剩余秒数
    pub fn calculate_eta(&self, remaining: u64) -> Option<u64> {
        match self.calculate_rate()? {
            0 => None,
            rate => Some(remaining / rate),
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
