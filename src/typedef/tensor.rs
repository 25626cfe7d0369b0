// 该文件是 Shanan （山南西风） 项目的一部分。
// src/typedef/tensor.rs - 带填充的量化张量
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
  cell::{Ref, RefCell, RefMut},
  fmt,
  rc::Rc,
};

use tracing::{debug, info};

use crate::{
  error::{DlError, Result},
  tool::alloc::{AlignedBuffer, Allocator, DEFAULT_ALIGN, TieredAllocator},
  typedef::Element,
};

type SharedBuffer<T> = Rc<RefCell<AlignedBuffer<T>>>;

enum Storage<T: Element> {
  Empty,
  /// 张量拥有这块内存
  Owned(SharedBuffer<T>),
  /// 非拥有视图，指向另一张量内存中从 `offset` 开始的区域
  View { arena: SharedBuffer<T>, offset: usize },
}

/// 量化特征图，布局为 HWC
///
/// - `shape`: 逻辑形状 `[height, width, channel]`
/// - `padding`: `[top, bottom, left, right]`
/// - `shape_with_padding`: `[top + height + bottom, left + width + right, channel]`，
///   作为 Concat2D 分支视图时 channel 为整个拼接结果的通道数
///
/// 内存按需申请：`calloc_element` / `malloc_element` / `apply_element` 只在尚未申请时才申请。
pub struct Tensor<T: Element> {
  exponent: i32,
  shape: [usize; 3],
  shape_with_padding: [usize; 3],
  padding: [usize; 4],
  storage: Storage<T>,
  allocator: Rc<dyn Allocator>,
}

impl<T: Element> Default for Tensor<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Element> Tensor<T> {
  pub fn new() -> Self {
    Self::with_allocator(Rc::new(TieredAllocator::unbounded()))
  }

  pub fn with_allocator(allocator: Rc<dyn Allocator>) -> Self {
    Self {
      exponent: 0,
      shape: [0; 3],
      shape_with_padding: [0; 3],
      padding: [0; 4],
      storage: Storage::Empty,
      allocator,
    }
  }

  /// 由不带填充的 HWC 数据创建张量
  pub fn from_element(shape: [usize; 3], exponent: i32, element: &[T]) -> Result<Self> {
    let mut tensor = Self::new();
    tensor.set_exponent(exponent).set_shape(shape)?;
    tensor.set_element(element)?;
    Ok(tensor)
  }

  /// 复制一个张量。`deep` 为真时复制数据，否则返回共享同一内存的非拥有视图
  pub fn copy_from(feature: &Tensor<T>, deep: bool) -> Result<Self> {
    let mut tensor = Self::with_allocator(feature.allocator.clone());
    tensor.exponent = feature.exponent;
    tensor.shape = feature.shape;
    tensor.shape_with_padding = feature.shape_with_padding;
    tensor.padding = feature.padding;

    match (&feature.storage, deep) {
      (Storage::Empty, _) => {}
      (_, true) => {
        // 深拷贝得到紧凑的通道布局
        let [height_p, width_p, channel_p] = feature.shape_with_padding;
        let channel = feature.shape[2];
        tensor.shape_with_padding[2] = channel;
        tensor.malloc_element()?;
        let source = feature.element()?;
        let mut target = tensor.element_mut()?;
        for i in 0..height_p * width_p {
          target[i * channel..(i + 1) * channel]
            .copy_from_slice(&source[i * channel_p..i * channel_p + channel]);
        }
      }
      (Storage::Owned(arena), false) => {
        tensor.storage = Storage::View {
          arena: arena.clone(),
          offset: 0,
        };
      }
      (Storage::View { arena, offset }, false) => {
        tensor.storage = Storage::View {
          arena: arena.clone(),
          offset: *offset,
        };
      }
    }
    Ok(tensor)
  }

  pub fn exponent(&self) -> i32 {
    self.exponent
  }

  pub fn shape(&self) -> &[usize; 3] {
    &self.shape
  }

  pub fn shape_with_padding(&self) -> &[usize; 3] {
    &self.shape_with_padding
  }

  pub fn padding(&self) -> &[usize; 4] {
    &self.padding
  }

  pub fn allocator(&self) -> &Rc<dyn Allocator> {
    &self.allocator
  }

  pub fn is_allocated(&self) -> bool {
    !matches!(self.storage, Storage::Empty)
  }

  /// 是否拥有内存（非拥有视图与未申请时均为假）
  pub fn is_owner(&self) -> bool {
    matches!(self.storage, Storage::Owned(_))
  }

  pub fn set_exponent(&mut self, exponent: i32) -> &mut Self {
    self.exponent = exponent;
    self
  }

  /// 记录逻辑形状，不申请内存
  ///
  /// 已申请内存时形状不可修改，需先 `free_element`。
  pub fn set_shape(&mut self, shape: [usize; 3]) -> Result<&mut Self> {
    if self.is_allocated() {
      if self.shape == shape {
        return Ok(self);
      }
      return Err(DlError::ShapeLocked {
        current: self.shape,
        requested: shape,
      });
    }

    self.shape = shape;
    self.shape_with_padding = [
      self.padding[0] + shape[0] + self.padding[1],
      self.padding[2] + shape[1] + self.padding[3],
      shape[2],
    ];
    Ok(self)
  }

  /// 设置填充
  ///
  /// 已申请内存时重新申请一块带新填充的内存，把原有数据复制到内部区域，边框清零；
  /// 未申请时只记录需求。
  pub fn set_padding(&mut self, padding: [usize; 4]) -> Result<&mut Self> {
    if self.padding == padding {
      return Ok(self);
    }

    let shape_with_padding = [
      padding[0] + self.shape[0] + padding[1],
      padding[2] + self.shape[1] + padding[3],
      self.shape_with_padding[2],
    ];

    match &self.storage {
      Storage::Empty => {}
      Storage::View { .. } => return Err(DlError::ViewLocked),
      Storage::Owned(old) => {
        let size = shape_with_padding.iter().product();
        let mut buffer = AlignedBuffer::<T>::new(&self.allocator, size, DEFAULT_ALIGN)?;
        let old = old.try_borrow().map_err(|_| DlError::BorrowConflict)?;

        let channel = self.shape_with_padding[2];
        for y in 0..self.shape[0] {
          for x in 0..self.shape[1] {
            let src = ((y + self.padding[0]) * self.shape_with_padding[1] + x + self.padding[2])
              * channel;
            let dst = ((y + padding[0]) * shape_with_padding[1] + x + padding[2]) * channel;
            buffer[dst..dst + channel].copy_from_slice(&old[src..src + channel]);
          }
        }
        drop(old);
        debug!(
          "重新申请带填充的内存: {:?} -> {:?}",
          self.shape_with_padding, shape_with_padding
        );
        self.storage = Storage::Owned(Rc::new(RefCell::new(buffer)));
      }
    }

    self.padding = padding;
    self.shape_with_padding = shape_with_padding;
    Ok(self)
  }

  /// 逐项取最大值后设置填充，用于一个张量被多个算子消费的情形
  pub fn require_padding(&mut self, padding: [usize; 4]) -> Result<&mut Self> {
    let mut merged = self.padding;
    for (m, p) in merged.iter_mut().zip(padding) {
      *m = (*m).max(p);
    }
    self.set_padding(merged)
  }

  pub(crate) fn set_channel_with_padding(&mut self, channel: usize) -> Result<()> {
    if channel < self.shape[2] {
      return Err(DlError::invalid(format!(
        "带填充的通道数 {} 小于通道数 {}",
        channel, self.shape[2]
      )));
    }
    if self.is_allocated() && self.shape_with_padding[2] != channel {
      return Err(DlError::ViewLocked);
    }
    self.shape_with_padding[2] = channel;
    Ok(())
  }

  /// 带填充的元素个数
  pub fn get_size(&self) -> usize {
    self.shape_with_padding.iter().product()
  }

  fn allocate(&mut self) -> Result<bool> {
    if self.is_allocated() {
      return Ok(false);
    }
    let buffer = AlignedBuffer::<T>::new(&self.allocator, self.get_size(), DEFAULT_ALIGN)?;
    self.storage = Storage::Owned(Rc::new(RefCell::new(buffer)));
    Ok(true)
  }

  /// 申请并清零内存，已申请时什么也不做
  pub fn calloc_element(&mut self) -> Result<()> {
    self.allocate().map(|_| ())
  }

  /// 申请内存但不保证内容，已申请时什么也不做
  pub fn malloc_element(&mut self) -> Result<()> {
    self.allocate().map(|_| ())
  }

  /// 申请内存（如需要），并把填充边框写为 `padding_value`，不改动内部数据
  pub fn apply_element(&mut self, padding_value: T) -> Result<()> {
    self.allocate()?;
    if self.padding == [0; 4] {
      return Ok(());
    }

    let [top, _, left, _] = self.padding;
    let [height, width, channel] = self.shape;
    let [height_p, width_p, channel_p] = self.shape_with_padding;
    let mut element = self.element_mut()?;
    for y in 0..height_p {
      let inner_row = y >= top && y < top + height;
      for x in 0..width_p {
        if inner_row && x >= left && x < left + width {
          continue;
        }
        let base = (y * width_p + x) * channel_p;
        element[base..base + channel].fill(padding_value);
      }
    }
    Ok(())
  }

  /// 释放内存。非拥有视图只放弃引用，不影响底层内存；可重复调用
  pub fn free_element(&mut self) {
    self.storage = Storage::Empty;
  }

  /// 从填充后原点开始的元素切片
  pub fn element(&self) -> Result<Ref<'_, [T]>> {
    match &self.storage {
      Storage::Empty => Err(DlError::NotAllocated),
      Storage::Owned(arena) => {
        let buffer = arena.try_borrow().map_err(|_| DlError::BorrowConflict)?;
        Ok(Ref::map(buffer, |b| &b[..]))
      }
      Storage::View { arena, offset } => {
        let offset = *offset;
        let buffer = arena.try_borrow().map_err(|_| DlError::BorrowConflict)?;
        Ok(Ref::map(buffer, |b| &b[offset..]))
      }
    }
  }

  pub fn element_mut(&mut self) -> Result<RefMut<'_, [T]>> {
    match &self.storage {
      Storage::Empty => Err(DlError::NotAllocated),
      Storage::Owned(arena) => {
        let buffer = arena
          .try_borrow_mut()
          .map_err(|_| DlError::BorrowConflict)?;
        Ok(RefMut::map(buffer, |b| &mut b[..]))
      }
      Storage::View { arena, offset } => {
        let offset = *offset;
        let buffer = arena
          .try_borrow_mut()
          .map_err(|_| DlError::BorrowConflict)?;
        Ok(RefMut::map(buffer, |b| &mut b[offset..]))
      }
    }
  }

  /// 元素内存的起始地址，用于缓存预取提示
  pub fn element_addr(&self) -> usize {
    let (arena, offset) = match &self.storage {
      Storage::Empty => return 0,
      Storage::Owned(arena) => (arena, 0),
      Storage::View { arena, offset } => (arena, *offset),
    };
    // 被可变借用时没有可用地址，预取只是提示
    arena
      .try_borrow()
      .map(|b| b.addr() + offset * std::mem::size_of::<T>())
      .unwrap_or_default()
  }

  pub fn element_bytes(&self) -> usize {
    self.get_size() * std::mem::size_of::<T>()
  }

  /// 以 `padding` 为填充时区域原点在切片中的下标
  ///
  /// `padding` 不能超过张量已有的填充。
  pub fn get_element_index(&self, padding: &[usize; 4]) -> Result<usize> {
    if padding.iter().zip(self.padding.iter()).any(|(p, a)| p > a) {
      return Err(DlError::PaddingTooSmall {
        required: *padding,
        available: self.padding,
      });
    }
    Ok(
      ((self.padding[0] - padding[0]) * self.shape_with_padding[1] + self.padding[2] - padding[2])
        * self.shape_with_padding[2],
    )
  }

  /// 逻辑坐标 `(y, x, c)` 在切片中的下标，不做边界检查
  #[inline(always)]
  pub fn offset_of(&self, y: usize, x: usize, c: usize) -> usize {
    ((y + self.padding[0]) * self.shape_with_padding[1] + x + self.padding[2])
      * self.shape_with_padding[2]
      + c
  }

  fn checked_offset(&self, index: [usize; 3], with_padding: bool) -> Result<usize> {
    let bound = if with_padding {
      [
        self.shape_with_padding[0],
        self.shape_with_padding[1],
        self.shape[2],
      ]
    } else {
      self.shape
    };
    if index.iter().zip(bound.iter()).any(|(i, b)| i >= b) {
      return Err(DlError::IndexOutOfRange {
        index: index.to_vec(),
        bound: bound.to_vec(),
      });
    }

    Ok(if with_padding {
      (index[0] * self.shape_with_padding[1] + index[1]) * self.shape_with_padding[2] + index[2]
    } else {
      self.offset_of(index[0], index[1], index[2])
    })
  }

  /// 读取元素。`with_padding` 为真时从填充后的原点计数，否则从逻辑原点计数
  pub fn get_element_value(&self, index: [usize; 3], with_padding: bool) -> Result<T> {
    let offset = self.checked_offset(index, with_padding)?;
    Ok(self.element()?[offset])
  }

  pub fn set_element_value(&mut self, index: [usize; 3], with_padding: bool, value: T) -> Result<()> {
    let offset = self.checked_offset(index, with_padding)?;
    self.element_mut()?[offset] = value;
    Ok(())
  }

  /// 以不带填充的 HWC 数据填充内部区域，必要时先申请内存
  pub fn set_element(&mut self, element: &[T]) -> Result<()> {
    let [height, width, channel] = self.shape;
    if element.len() != height * width * channel {
      return Err(DlError::shape(&[height * width * channel], &[element.len()]));
    }
    self.calloc_element()?;

    let [_, width_p, channel_p] = self.shape_with_padding;
    let base = self.offset_of(0, 0, 0);
    let mut dst = self.element_mut()?;
    for y in 0..height {
      for x in 0..width {
        let d = base + (y * width_p + x) * channel_p;
        let s = (y * width + x) * channel;
        dst[d..d + channel].copy_from_slice(&element[s..s + channel]);
      }
    }
    Ok(())
  }

  /// 按 HWC 顺序导出不带填充的数据
  pub fn to_vec(&self) -> Result<Vec<T>> {
    let [height, width, channel] = self.shape;
    let element = self.element()?;
    let mut out = Vec::with_capacity(height * width * channel);
    for y in 0..height {
      for x in 0..width {
        let base = self.offset_of(y, x, 0);
        out.extend_from_slice(&element[base..base + channel]);
      }
    }
    Ok(out)
  }

  /// 让本张量成为 `owner` 内存中从 `offset` 开始的非拥有视图
  pub(crate) fn alias_into(&mut self, owner: &Tensor<T>, offset: usize) -> Result<()> {
    match &owner.storage {
      Storage::Owned(arena) => {
        self.storage = Storage::View {
          arena: arena.clone(),
          offset,
        };
        Ok(())
      }
      Storage::View { .. } => Err(DlError::ViewLocked),
      Storage::Empty => Err(DlError::NotAllocated),
    }
  }

  /// 是否为 `owner` 内存中从 `offset` 开始的视图
  pub fn is_view_of(&self, owner: &Tensor<T>, offset: usize) -> bool {
    match (&self.storage, &owner.storage) {
      (Storage::View { arena, offset: o }, Storage::Owned(owned)) => {
        Rc::ptr_eq(arena, owned) && *o == offset
      }
      _ => false,
    }
  }

  pub fn check_shape(&self, feature: &Tensor<T>) -> bool {
    self.shape == feature.shape
  }

  /// 与参考数据（不带填充的 HWC）逐项比较，允许 `bias` 的误差
  pub fn check_element(&self, gt_element: &[T], bias: i64, info: bool) -> Result<bool> {
    if info {
      self.print_shape();
    }
    let element = self.to_vec()?;
    if element.len() != gt_element.len() {
      return Err(DlError::shape(&[element.len()], &[gt_element.len()]));
    }

    let [_, width, channel] = self.shape;
    for (i, (a, b)) in element.iter().zip(gt_element).enumerate() {
      if (a.to_i64() - b.to_i64()).abs() > bias {
        info!(
          "element[{}, {}, {}]: {:?} v.s. {:?}",
          i / (width * channel),
          (i / channel) % width,
          i % channel,
          a,
          b
        );
        return Ok(false);
      }
    }

    if info {
      info!("PASS");
    }
    Ok(true)
  }

  pub fn print_shape(&self) {
    info!(
      "shape = {:?}, shape_with_padding = {:?}, padding = {:?}, exponent = {}",
      self.shape, self.shape_with_padding, self.padding, self.exponent
    );
  }

  /// 类似 numpy 的 `tensor[y_start:y_end, x_start:x_end, c]`
  pub fn print2d(
    &self,
    y_range: std::ops::Range<usize>,
    x_range: std::ops::Range<usize>,
    c: usize,
    message: &str,
    with_padding: bool,
  ) -> Result<()> {
    info!("{}[{:?}, {:?}, {}]:", message, y_range, x_range, c);
    for y in y_range {
      let row = x_range
        .clone()
        .map(|x| self.get_element_value([y, x, c], with_padding))
        .collect::<Result<Vec<_>>>()?;
      info!("{:?}", row);
    }
    Ok(())
  }
}

impl<T: Element> fmt::Debug for Tensor<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let storage = match &self.storage {
      Storage::Empty => "empty",
      Storage::Owned(_) => "owned",
      Storage::View { .. } => "view",
    };
    f.debug_struct("Tensor")
      .field("exponent", &self.exponent)
      .field("shape", &self.shape)
      .field("shape_with_padding", &self.shape_with_padding)
      .field("padding", &self.padding)
      .field("storage", &storage)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ramp(shape: [usize; 3]) -> Tensor<i16> {
    let data: Vec<i16> = (0..shape.iter().product::<usize>() as i16).collect();
    Tensor::from_element(shape, -4, &data).unwrap()
  }

  #[test]
  fn shape_with_padding_tracks_padding() {
    let mut tensor = Tensor::<i8>::new();
    tensor.set_shape([5, 7, 3]).unwrap();
    tensor.set_padding([1, 2, 3, 4]).unwrap();
    assert_eq!(tensor.shape_with_padding(), &[1 + 5 + 2, 3 + 7 + 4, 3]);
    assert!(!tensor.is_allocated());
    assert_eq!(tensor.get_size(), 8 * 14 * 3);
  }

  #[test]
  fn calloc_is_lazy_and_idempotent() {
    let mut tensor = Tensor::<i16>::new();
    tensor.set_shape([2, 2, 1]).unwrap();
    tensor.calloc_element().unwrap();
    tensor.set_element_value([1, 1, 0], false, 9).unwrap();
    tensor.calloc_element().unwrap();
    assert_eq!(tensor.get_element_value([1, 1, 0], false).unwrap(), 9);
  }

  #[test]
  fn set_padding_keeps_interior_and_zeroes_border() {
    let mut tensor = ramp([2, 3, 2]);
    tensor.set_padding([1, 1, 2, 0]).unwrap();
    assert_eq!(tensor.shape_with_padding(), &[4, 5, 2]);
    assert_eq!(tensor.to_vec().unwrap(), (0..12).collect::<Vec<i16>>());
    assert_eq!(tensor.get_element_value([0, 0, 0], true).unwrap(), 0);
    assert_eq!(tensor.get_element_value([1, 2, 1], true).unwrap(), 1);
    assert_eq!(tensor.get_element_value([0, 1, 1], false).unwrap(), 3);
  }

  #[test]
  fn apply_element_writes_only_border() {
    let mut tensor = ramp([2, 2, 1]);
    tensor.set_padding([1, 1, 1, 1]).unwrap();
    tensor.apply_element(-1).unwrap();
    let element = tensor.element().unwrap().to_vec();
    assert_eq!(
      element,
      vec![-1, -1, -1, -1, -1, 0, 1, -1, -1, 2, 3, -1, -1, -1, -1, -1]
    );
  }

  #[test]
  fn logical_index_never_reaches_border() {
    let mut tensor = ramp([2, 2, 1]);
    tensor.set_padding([1, 1, 1, 1]).unwrap();
    assert!(tensor.get_element_value([2, 0, 0], false).is_err());
    assert!(tensor.get_element_value([3, 3, 0], true).is_ok());
  }

  #[test]
  fn shape_is_locked_while_allocated() {
    let mut tensor = ramp([2, 2, 1]);
    assert!(matches!(
      tensor.set_shape([3, 3, 1]),
      Err(DlError::ShapeLocked { .. })
    ));
    tensor.free_element();
    tensor.free_element();
    assert!(tensor.set_shape([3, 3, 1]).is_ok());
  }

  #[test]
  fn shallow_copy_is_a_non_owning_view() {
    let mut tensor = ramp([1, 2, 1]);
    let mut view = Tensor::copy_from(&tensor, false).unwrap();
    assert!(!view.is_owner());
    assert!(view.is_view_of(&tensor, 0));
    view.set_element_value([0, 1, 0], false, 42).unwrap();
    assert_eq!(tensor.get_element_value([0, 1, 0], false).unwrap(), 42);

    let deep = Tensor::copy_from(&tensor, true).unwrap();
    assert!(deep.is_owner());
    tensor.set_element_value([0, 0, 0], false, 7).unwrap();
    assert_eq!(deep.get_element_value([0, 0, 0], false).unwrap(), 0);

    view.free_element();
    assert!(tensor.is_allocated());
    assert!(matches!(view.set_padding([1, 0, 0, 0]), Ok(_)));
  }

  #[test]
  fn element_index_honours_requested_padding() {
    let mut tensor = ramp([2, 2, 1]);
    tensor.set_padding([2, 0, 1, 0]).unwrap();
    assert_eq!(tensor.get_element_index(&[0, 0, 0, 0]).unwrap(), 2 * 3 + 1);
    assert_eq!(tensor.get_element_index(&[1, 0, 1, 0]).unwrap(), 3);
    assert!(tensor.get_element_index(&[3, 0, 0, 0]).is_err());
  }

  #[test]
  fn check_element_with_tolerance() {
    let tensor = ramp([1, 3, 1]);
    assert!(tensor.check_element(&[0, 1, 2], 0, false).unwrap());
    assert!(tensor.check_element(&[1, 2, 3], 1, false).unwrap());
    assert!(!tensor.check_element(&[0, 1, 5], 2, false).unwrap());
  }
}
