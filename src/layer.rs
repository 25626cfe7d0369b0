// 该文件是 Shanan （山南西风） 项目的一部分。
// src/layer.rs - 层与模型的组合约定
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

//! 层把一个算子与两阶段的形状推导、输出内存管理组合在一起：
//!
//! 1. `build(input)`：推导输出形状，并把本层需要的填充推回输入张量，
//!    由输入的生产者在计算前满足；
//! 2. `call(input)`：按需申请输出内存，可选地发出预取提示，然后调用算子。

mod avg_pool2d;
mod concat2d;
mod conv2d;
mod depthwise_conv2d;

use tracing::debug;

use crate::{error::Result, typedef::{Element, Tensor}};

pub use self::avg_pool2d::AvgPool2D;
pub use self::concat2d::Concat2D;
pub use self::conv2d::Conv2D;
pub use self::depthwise_conv2d::DepthwiseConv2D;

/// 单输入的层
pub trait Layer<T: Element> {
  fn name(&self) -> &str;

  /// 推导输出形状并给输入推回所需填充
  fn build(&mut self, input: &mut Tensor<T>) -> Result<()>;

  /// 计算本层输出
  fn call(&mut self, input: &Tensor<T>, autoload_enable: bool) -> Result<&Tensor<T>>;

  fn output(&self) -> &Tensor<T>;

  fn output_mut(&mut self) -> &mut Tensor<T>;
}

/// 由若干层组成的固定计算图
///
/// `forward` 只在输入形状与上一次不同时才调用 `build`，
/// 对分辨率固定的连续帧省去重复的形状推导。
pub trait Model<T: Element> {
  fn build(&mut self, input: &mut Tensor<T>) -> Result<()>;

  fn call(&mut self, input: &Tensor<T>) -> Result<()>;

  /// 上一次 `build` 时的输入形状
  fn built_shape(&mut self) -> &mut Option<[usize; 3]>;

  fn forward(&mut self, input: &mut Tensor<T>) -> Result<()> {
    let shape = *input.shape();
    if *self.built_shape() != Some(shape) {
      debug!("输入形状变为 {:?}，重新推导各层形状", shape);
      self.build(input)?;
      *self.built_shape() = Some(shape);
    }
    self.call(input)
  }
}
