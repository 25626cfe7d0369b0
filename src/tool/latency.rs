// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tool/latency.rs - 耗时统计
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct Latency {
  start: Option<Instant>,
  end: Option<Instant>,
}

impl Latency {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn start(&mut self) {
    self.start = Some(Instant::now());
    self.end = None;
  }

  pub fn end(&mut self) {
    self.end = Some(Instant::now());
  }

  pub fn period(&self) -> Duration {
    match (self.start, self.end) {
      (Some(start), Some(end)) => end.saturating_duration_since(start),
      _ => Duration::ZERO,
    }
  }

  /// 以 `{prefix}::{key}: {period}` 的格式输出
  pub fn print(&self, prefix: &str, key: &str) {
    debug!("{}::{}: {:.2?}", prefix, key, self.period());
  }
}
