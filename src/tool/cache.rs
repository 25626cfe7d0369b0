// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tool/cache.rs - 缓存预取提示
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

use std::{cell::Cell, fmt::Debug};

use tracing::trace;

/// 初始化预取功能的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInit {
  /// 初始化成功
  Enabled,
  /// 初始化成功，另一种预取方式已被关闭（preload 与 autoload 互斥）
  EnabledOtherDisabled,
  /// 芯片不支持
  Unsupported,
}

/// 按地址与长度发出的缓存预取提示
///
/// 预取是尽力而为的，空实现不能改变计算结果。
pub trait CacheHint: Debug {
  fn preload_init(&self, enable: bool) -> CacheInit;
  fn preload(&self, addr: usize, size: usize);
  fn autoload_init(&self, enable: bool) -> CacheInit;
  fn autoload(&self, addr: usize, size: usize, second: Option<(usize, usize)>);
}

/// 不做任何事的预取实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl CacheHint for NoopCache {
  fn preload_init(&self, _enable: bool) -> CacheInit {
    CacheInit::Unsupported
  }

  fn preload(&self, _addr: usize, _size: usize) {}

  fn autoload_init(&self, _enable: bool) -> CacheInit {
    CacheInit::Unsupported
  }

  fn autoload(&self, _addr: usize, _size: usize, _second: Option<(usize, usize)>) {}
}

/// 只记录预取请求的实现，便于在主机上观察层的访存行为
#[derive(Debug, Default)]
pub struct TracingCache {
  preload: Cell<bool>,
  autoload: Cell<bool>,
  requests: Cell<usize>,
}

impl TracingCache {
  pub fn requests(&self) -> usize {
    self.requests.get()
  }
}

impl CacheHint for TracingCache {
  fn preload_init(&self, enable: bool) -> CacheInit {
    self.preload.set(enable);
    if enable && self.autoload.replace(false) {
      CacheInit::EnabledOtherDisabled
    } else {
      CacheInit::Enabled
    }
  }

  fn preload(&self, addr: usize, size: usize) {
    if self.preload.get() {
      self.requests.set(self.requests.get() + 1);
      trace!("preload: {:#x} ({} 字节)", addr, size);
    }
  }

  fn autoload_init(&self, enable: bool) -> CacheInit {
    self.autoload.set(enable);
    if enable && self.preload.replace(false) {
      CacheInit::EnabledOtherDisabled
    } else {
      CacheInit::Enabled
    }
  }

  fn autoload(&self, addr: usize, size: usize, second: Option<(usize, usize)>) {
    if self.autoload.get() {
      self.requests.set(self.requests.get() + 1);
      trace!("autoload: {:#x} ({} 字节), {:?}", addr, size, second);
    }
  }
}
