// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tool/alloc.rs - 对齐内存申请与分级内存池
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

use std::{
  alloc::Layout,
  cell::Cell,
  fmt,
  ops::{Deref, DerefMut},
  ptr::NonNull,
  rc::Rc,
};

use tracing::{error, trace, warn};

use crate::{
  error::{DlError, Result},
  typedef::Element,
};

/// 默认按 16 字节对齐，与 SIMD 指令的访存要求一致
pub const DEFAULT_ALIGN: usize = 16;

/// 内存层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
  /// 片内 SRAM，速度快、容量小
  Internal,
  /// 片外 PSRAM，速度慢、容量大
  External,
}

/// 一次成功的内存申请
#[derive(Debug)]
pub struct Allocation {
  ptr: NonNull<u8>,
  layout: Layout,
  tier: MemoryTier,
}

impl Allocation {
  pub fn tier(&self) -> MemoryTier {
    self.tier
  }

  pub fn size(&self) -> usize {
    self.layout.size()
  }
}

/// 内存申请能力
///
/// 返回的内存总是清零的；申请失败返回 `None`，由调用方决定如何处理。
pub trait Allocator: fmt::Debug {
  fn allocate(&self, layout: Layout) -> Option<Allocation>;
  fn deallocate(&self, allocation: Allocation);
}

/// 带容量统计的内存池
#[derive(Debug)]
pub struct MemoryPool {
  tier: MemoryTier,
  capacity: Option<usize>,
  used: Cell<usize>,
}

impl MemoryPool {
  pub fn new(tier: MemoryTier, capacity: usize) -> Self {
    Self {
      tier,
      capacity: Some(capacity),
      used: Cell::new(0),
    }
  }

  pub fn unbounded(tier: MemoryTier) -> Self {
    Self {
      tier,
      capacity: None,
      used: Cell::new(0),
    }
  }

  pub fn tier(&self) -> MemoryTier {
    self.tier
  }

  pub fn used(&self) -> usize {
    self.used.get()
  }

  pub fn remaining(&self) -> Option<usize> {
    self.capacity.map(|c| c.saturating_sub(self.used.get()))
  }

  fn try_reserve(&self, size: usize) -> bool {
    match self.remaining() {
      Some(remaining) if remaining < size => false,
      _ => {
        self.used.set(self.used.get() + size);
        true
      }
    }
  }

  fn release(&self, size: usize) {
    self.used.set(self.used.get().saturating_sub(size));
  }
}

/// 主内存池耗尽后回退到次级内存池的分配器
#[derive(Debug)]
pub struct TieredAllocator {
  primary: MemoryPool,
  secondary: Option<MemoryPool>,
}

impl TieredAllocator {
  pub fn new(primary: MemoryPool, secondary: Option<MemoryPool>) -> Self {
    Self { primary, secondary }
  }

  /// 不限容量的单级分配器
  pub fn unbounded() -> Self {
    Self::new(MemoryPool::unbounded(MemoryTier::Internal), None)
  }

  pub fn primary(&self) -> &MemoryPool {
    &self.primary
  }

  pub fn secondary(&self) -> Option<&MemoryPool> {
    self.secondary.as_ref()
  }

  fn pool(&self, tier: MemoryTier) -> Option<&MemoryPool> {
    if self.primary.tier == tier {
      Some(&self.primary)
    } else {
      self.secondary.as_ref().filter(|pool| pool.tier == tier)
    }
  }

  fn reserve(&self, size: usize) -> Option<MemoryTier> {
    if self.primary.try_reserve(size) {
      return Some(self.primary.tier);
    }

    match &self.secondary {
      Some(secondary) => {
        warn!(
          "{:?} 内存不足 (需要 {} 字节, 剩余 {:?} 字节), 回退到 {:?}",
          self.primary.tier,
          size,
          self.primary.remaining(),
          secondary.tier
        );
        if secondary.try_reserve(size) {
          Some(secondary.tier)
        } else {
          error!(
            "{:?} 内存申请失败: 需要 {} 字节, 剩余 {:?} 字节",
            secondary.tier,
            size,
            secondary.remaining()
          );
          None
        }
      }
      None => {
        error!(
          "内存申请失败: 需要 {} 字节, 剩余 {:?} 字节",
          size,
          self.primary.remaining()
        );
        None
      }
    }
  }
}

impl Default for TieredAllocator {
  fn default() -> Self {
    Self::unbounded()
  }
}

impl Allocator for TieredAllocator {
  fn allocate(&self, layout: Layout) -> Option<Allocation> {
    let tier = self.reserve(layout.size())?;
    // SAFETY: layout 的大小在 AlignedBuffer::new 中保证非零
    let raw = unsafe { std::alloc::alloc_zeroed(layout) };
    match NonNull::new(raw) {
      Some(ptr) => {
        trace!("申请 {} 字节 ({:?})", layout.size(), tier);
        Some(Allocation { ptr, layout, tier })
      }
      None => {
        if let Some(pool) = self.pool(tier) {
          pool.release(layout.size());
        }
        error!("系统内存申请失败: {} 字节", layout.size());
        None
      }
    }
  }

  fn deallocate(&self, allocation: Allocation) {
    if let Some(pool) = self.pool(allocation.tier) {
      pool.release(allocation.layout.size());
    }
    trace!("释放 {} 字节 ({:?})", allocation.layout.size(), allocation.tier);
    // SAFETY: allocation 由本分配器以相同的 layout 申请
    unsafe { std::alloc::dealloc(allocation.ptr.as_ptr(), allocation.layout) };
  }
}

/// 对齐的定长元素缓冲区，析构时归还给申请它的分配器
pub struct AlignedBuffer<T: Element> {
  ptr: NonNull<T>,
  len: usize,
  allocation: Option<Allocation>,
  allocator: Rc<dyn Allocator>,
}

impl<T: Element> AlignedBuffer<T> {
  pub fn new(allocator: &Rc<dyn Allocator>, len: usize, align: usize) -> Result<Self> {
    let align = align.max(std::mem::align_of::<T>());
    let bytes = len
      .checked_mul(std::mem::size_of::<T>())
      .ok_or(DlError::AllocFailed {
        bytes: usize::MAX,
        align,
      })?
      .max(1);
    let layout = Layout::from_size_align(bytes, align)
      .map_err(|_| DlError::AllocFailed { bytes, align })?;
    let allocation = allocator
      .allocate(layout)
      .ok_or(DlError::AllocFailed { bytes, align })?;

    Ok(Self {
      ptr: allocation.ptr.cast::<T>(),
      len,
      allocation: Some(allocation),
      allocator: allocator.clone(),
    })
  }

  pub fn tier(&self) -> Option<MemoryTier> {
    self.allocation.as_ref().map(Allocation::tier)
  }

  pub fn addr(&self) -> usize {
    self.ptr.as_ptr() as usize
  }
}

impl<T: Element> Deref for AlignedBuffer<T> {
  type Target = [T];

  fn deref(&self) -> &[T] {
    // SAFETY: ptr 指向 len 个已清零、对齐的 T，生命周期由 self 持有
    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }
}

impl<T: Element> DerefMut for AlignedBuffer<T> {
  fn deref_mut(&mut self) -> &mut [T] {
    // SAFETY: 同上，且 &mut self 保证独占
    unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }
}

impl<T: Element> Drop for AlignedBuffer<T> {
  fn drop(&mut self) {
    if let Some(allocation) = self.allocation.take() {
      self.allocator.deallocate(allocation);
    }
  }
}

impl<T: Element> fmt::Debug for AlignedBuffer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AlignedBuffer")
      .field("len", &self.len)
      .field("tier", &self.tier())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tiered(primary: usize, secondary: Option<usize>) -> Rc<TieredAllocator> {
    Rc::new(TieredAllocator::new(
      MemoryPool::new(MemoryTier::Internal, primary),
      secondary.map(|c| MemoryPool::new(MemoryTier::External, c)),
    ))
  }

  #[test]
  fn buffer_is_zeroed_and_aligned() {
    let allocator: Rc<dyn Allocator> = Rc::new(TieredAllocator::unbounded());
    let buffer = AlignedBuffer::<i16>::new(&allocator, 33, DEFAULT_ALIGN).unwrap();
    assert_eq!(buffer.len(), 33);
    assert!(buffer.iter().all(|&v| v == 0));
    assert_eq!(buffer.addr() % DEFAULT_ALIGN, 0);
  }

  #[test]
  fn falls_back_to_secondary_tier() {
    let tiers = tiered(64, Some(1024));
    let allocator: Rc<dyn Allocator> = tiers.clone();
    let small = AlignedBuffer::<i8>::new(&allocator, 32, DEFAULT_ALIGN).unwrap();
    assert_eq!(small.tier(), Some(MemoryTier::Internal));
    let large = AlignedBuffer::<i8>::new(&allocator, 128, DEFAULT_ALIGN).unwrap();
    assert_eq!(large.tier(), Some(MemoryTier::External));
    assert_eq!(tiers.primary().used(), 32);
    assert_eq!(tiers.secondary().unwrap().used(), 128);
  }

  #[test]
  fn fails_when_every_tier_is_exhausted() {
    let allocator: Rc<dyn Allocator> = tiered(16, Some(16));
    let result = AlignedBuffer::<i16>::new(&allocator, 64, DEFAULT_ALIGN);
    assert!(matches!(result, Err(DlError::AllocFailed { bytes: 128, .. })));
  }

  #[test]
  fn oversized_length_fails_without_reserving() {
    let tiers = tiered(256, None);
    let allocator: Rc<dyn Allocator> = tiers.clone();
    let result = AlignedBuffer::<i16>::new(&allocator, usize::MAX / 2 + 1, DEFAULT_ALIGN);
    assert!(matches!(
      result,
      Err(DlError::AllocFailed {
        bytes: usize::MAX,
        ..
      })
    ));
    assert_eq!(tiers.primary().used(), 0);
  }

  #[test]
  fn drop_returns_bytes_to_pool() {
    let tiers = tiered(256, None);
    let allocator: Rc<dyn Allocator> = tiers.clone();
    {
      let _buffer = AlignedBuffer::<i16>::new(&allocator, 100, DEFAULT_ALIGN).unwrap();
      assert_eq!(tiers.primary().used(), 200);
    }
    assert_eq!(tiers.primary().used(), 0);
  }
}
