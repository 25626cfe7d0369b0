// 该文件是 Shanan （山南西风） 项目的一部分。
// src/layer/concat2d.rs - 零拷贝的通道拼接层
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

//! 通道拼接层
//!
//! 拼接结果只申请一块内存，各分支的输出张量成为这块内存在对应通道偏移处的非拥有视图，
//! 生产者直接写入最终位置。使用顺序：
//!
//! 1. 各分支 `build`，然后 `Concat2D::build`；
//! 2. 拼接结果的消费者 `build`（向拼接结果推回填充）；
//! 3. `Concat2D::backward`，把最大填充同步到拼接结果与每个分支；
//! 4. 每次计算前 `Concat2D::calloc_element`，再依次调用各分支。

use tracing::debug;

use crate::{
  error::{DlError, Result},
  nn,
  tool::Latency,
  typedef::{Element, Tensor},
};

#[derive(Debug)]
pub struct Concat2D<T: Element> {
  name: String,
  offset: Vec<usize>,
  output: Tensor<T>,
}

impl<T: Element> Default for Concat2D<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Element> Concat2D<T> {
  pub fn new() -> Self {
    Self {
      name: "concat2d".to_string(),
      offset: Vec::new(),
      output: Tensor::new(),
    }
  }

  pub fn named(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn output(&self) -> &Tensor<T> {
    &self.output
  }

  pub fn output_mut(&mut self) -> &mut Tensor<T> {
    &mut self.output
  }

  /// 各分支在拼接结果中的通道偏移
  pub fn offset(&self) -> &[usize] {
    &self.offset
  }

  fn check_arity(&self, count: usize) -> Result<()> {
    if count != self.offset.len() {
      return Err(DlError::invalid(format!(
        "{}: 分支数量 {} 与 build 时的 {} 不一致",
        self.name,
        count,
        self.offset.len()
      )));
    }
    Ok(())
  }

  /// 推导拼接结果的形状与指数，各分支高、宽、指数必须一致
  pub fn build(&mut self, inputs: &[&Tensor<T>]) -> Result<()> {
    let output_shape = nn::concat_shape(inputs)?;

    self.offset.clear();
    let mut offset = 0;
    for input in inputs {
      self.offset.push(offset);
      offset += input.shape()[2];
    }

    if self.output.shape() != &output_shape {
      self.output.free_element();
    }
    self.output.set_shape(output_shape)?;
    self.output.set_exponent(inputs[0].exponent());
    debug!("{}: {:?}, 通道偏移 {:?}", self.name, output_shape, self.offset);
    Ok(())
  }

  /// 把拼接结果与各分支的填充统一为逐项最大值，并让各分支的通道跨度等于拼接结果的通道数
  pub fn backward(&mut self, inputs: &mut [&mut Tensor<T>]) -> Result<()> {
    self.check_arity(inputs.len())?;

    let mut max_padding = *self.output.padding();
    let mut max_channel = self.output.shape_with_padding()[2];
    for input in inputs.iter() {
      for (m, p) in max_padding.iter_mut().zip(input.padding()) {
        *m = (*m).max(*p);
      }
      max_channel = max_channel.max(input.shape_with_padding()[2]);
    }

    self.output.set_padding(max_padding)?;
    self.output.set_channel_with_padding(max_channel)?;
    for input in inputs.iter_mut() {
      let stale = input.padding() != &max_padding || input.shape_with_padding()[2] != max_channel;
      if stale && input.is_allocated() {
        // 分支在计算前会重新成为视图，旧内存里的数据不再需要
        input.free_element();
      }
      input.set_padding(max_padding)?;
      input.set_channel_with_padding(max_channel)?;
      if input.shape_with_padding()[..2] != self.output.shape_with_padding()[..2] {
        return Err(DlError::shape(
          self.output.shape_with_padding(),
          input.shape_with_padding(),
        ));
      }
    }
    Ok(())
  }

  /// 申请拼接结果的内存，并让每个分支成为对应通道偏移处的视图
  pub fn calloc_element(&mut self, inputs: &mut [&mut Tensor<T>]) -> Result<()> {
    self.check_arity(inputs.len())?;
    let mut latency = Latency::new();
    latency.start();

    self.output.calloc_element()?;
    for (input, &offset) in inputs.iter_mut().zip(&self.offset) {
      if input.shape_with_padding() != self.output.shape_with_padding()
        || input.padding() != self.output.padding()
      {
        return Err(DlError::shape(
          self.output.shape_with_padding(),
          input.shape_with_padding(),
        ));
      }
      input.alias_into(&self.output, offset)?;
    }

    latency.end();
    latency.print(&self.name, "calloc");
    Ok(())
  }

  /// 拼接各分支。已是视图的分支已经写在最终位置，其余分支会被复制进来
  pub fn call(&mut self, inputs: &[&Tensor<T>]) -> Result<&Tensor<T>> {
    self.check_arity(inputs.len())?;
    let mut latency = Latency::new();
    latency.start();
    self.output.calloc_element()?;
    nn::concat2d(&mut self.output, inputs)?;
    latency.end();
    latency.print(&self.name, "concat2d");
    Ok(&self.output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn shaped(shape: [usize; 3], padding: [usize; 4]) -> Tensor<i16> {
    let mut tensor = Tensor::new();
    tensor.set_exponent(-5).set_shape(shape).unwrap();
    tensor.set_padding(padding).unwrap();
    tensor
  }

  #[test]
  fn backward_propagates_max_padding_and_channel() {
    let mut a = shaped([4, 4, 3], [1, 0, 0, 1]);
    let mut b = shaped([4, 4, 5], [0, 2, 1, 0]);
    let mut concat = Concat2D::new();
    concat.build(&[&a, &b]).unwrap();
    assert_eq!(concat.output().shape(), &[4, 4, 8]);
    assert_eq!(concat.offset(), &[0, 3]);

    concat.backward(&mut [&mut a, &mut b]).unwrap();
    for tensor in [concat.output(), &a, &b] {
      assert_eq!(tensor.padding(), &[1, 2, 1, 1]);
      assert_eq!(tensor.shape_with_padding(), &[7, 6, 8]);
    }
  }

  #[test]
  fn branches_write_directly_into_shared_output() {
    let mut a = shaped([1, 2, 1], [0; 4]);
    let mut b = shaped([1, 2, 2], [0; 4]);
    let mut concat = Concat2D::new();
    concat.build(&[&a, &b]).unwrap();
    concat.backward(&mut [&mut a, &mut b]).unwrap();
    concat.calloc_element(&mut [&mut a, &mut b]).unwrap();
    assert!(a.is_view_of(concat.output(), 0));
    assert!(b.is_view_of(concat.output(), 1));

    a.set_element(&[1, 2]).unwrap();
    b.set_element(&[10, 11, 20, 21]).unwrap();
    let output = concat.call(&[&a, &b]).unwrap();
    assert_eq!(output.to_vec().unwrap(), vec![1, 10, 11, 2, 20, 21]);
  }

  #[test]
  fn owned_branches_are_copied() {
    let a = Tensor::<i16>::from_element([1, 1, 1], -5, &[7]).unwrap();
    let b = Tensor::<i16>::from_element([1, 1, 1], -5, &[9]).unwrap();
    let mut concat = Concat2D::new();
    concat.build(&[&a, &b]).unwrap();
    assert_eq!(concat.call(&[&a, &b]).unwrap().to_vec().unwrap(), vec![7, 9]);
  }

  #[test]
  fn build_rejects_exponent_mismatch() {
    let a = shaped([1, 1, 1], [0; 4]);
    let mut b = shaped([1, 1, 1], [0; 4]);
    b.set_exponent(-4);
    assert!(matches!(
      Concat2D::new().build(&[&a, &b]),
      Err(DlError::ExponentMismatch { .. })
    ));
  }
}
