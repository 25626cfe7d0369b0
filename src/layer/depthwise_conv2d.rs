// 该文件是 Shanan （山南西风） 项目的一部分。
// src/layer/depthwise_conv2d.rs - 逐通道卷积层
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

use std::rc::Rc;

use crate::{
  error::{DlError, Result},
  layer::Layer,
  nn::{self, AssignCore, PaddingType},
  tool::{CacheHint, Latency, NoopCache},
  typedef::{Activation, Bias, Element, Filter, Tensor},
};

#[derive(Debug)]
pub struct DepthwiseConv2D<T: Element> {
  name: String,
  filter: Rc<Filter<T>>,
  bias: Option<Rc<Bias<T>>>,
  activation: Option<Rc<Activation<T>>>,
  padding_type: PaddingType,
  stride_y: usize,
  stride_x: usize,
  padding: [usize; 4],
  assign_core: AssignCore,
  cache: Rc<dyn CacheHint>,
  output: Tensor<T>,
}

impl<T: Element> DepthwiseConv2D<T> {
  /// 卷积核形状为 `[filter_height, filter_width, channel, 1]`
  pub fn new(output_exponent: i32, filter: Rc<Filter<T>>) -> Self {
    let mut output = Tensor::new();
    output.set_exponent(output_exponent);
    Self {
      name: "depthwise_conv2d".to_string(),
      filter,
      bias: None,
      activation: None,
      padding_type: PaddingType::Valid,
      stride_y: 1,
      stride_x: 1,
      padding: [0; 4],
      assign_core: AssignCore::default(),
      cache: Rc::new(NoopCache),
      output,
    }
  }

  pub fn named(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  pub fn bias(mut self, bias: Rc<Bias<T>>) -> Self {
    self.bias = Some(bias);
    self
  }

  pub fn activation(mut self, activation: Rc<Activation<T>>) -> Self {
    self.activation = Some(activation);
    self
  }

  pub fn padding_type(mut self, padding_type: PaddingType) -> Self {
    self.padding_type = padding_type;
    self
  }

  pub fn stride(mut self, stride_y: usize, stride_x: usize) -> Self {
    self.stride_y = stride_y;
    self.stride_x = stride_x;
    self
  }

  pub fn assign_core(mut self, assign_core: AssignCore) -> Self {
    self.assign_core = assign_core;
    self
  }

  pub fn cache(mut self, cache: Rc<dyn CacheHint>) -> Self {
    self.cache = cache;
    self
  }

  /// 预取逐通道卷积核
  pub fn preload(&self) {
    self
      .cache
      .preload(self.filter.element().as_ptr() as usize, std::mem::size_of_val(self.filter.element()));
  }
}

impl<T: Element> Layer<T> for DepthwiseConv2D<T> {
  fn name(&self) -> &str {
    &self.name
  }

  fn build(&mut self, input: &mut Tensor<T>) -> Result<()> {
    if input.shape()[0] == 0 || input.shape()[1] == 0 {
      return Err(DlError::invalid(format!("{}: 输入形状为空 {:?}", self.name, input.shape())));
    }
    let output_shape = nn::get_output_shape(
      input.shape(),
      self.filter.shape_with_dilation(),
      self.stride_y,
      self.stride_x,
      self.padding_type,
      true,
    )?;
    if self.output.shape() != &output_shape {
      self.output.free_element();
    }
    self.output.set_shape(output_shape)?;
    self.padding = nn::get_pad_size(
      &output_shape,
      input.shape(),
      self.filter.shape_with_dilation(),
      self.stride_y,
      self.stride_x,
      self.padding_type,
    )?;
    input.require_padding(self.padding)?;
    Ok(())
  }

  fn call(&mut self, input: &Tensor<T>, autoload_enable: bool) -> Result<&Tensor<T>> {
    let mut latency = Latency::new();
    latency.start();
    self.output.calloc_element()?;
    latency.end();
    latency.print(&self.name, "calloc");

    if autoload_enable {
      self.cache.autoload(
        self.output.element_addr(),
        self.output.element_bytes(),
        Some((input.element_addr(), input.element_bytes())),
      );
    }

    latency.start();
    nn::depthwise_conv2d(
      &mut self.output,
      input,
      &self.padding,
      &self.filter,
      self.stride_y,
      self.stride_x,
      self.bias.as_deref(),
      self.activation.as_deref(),
      self.assign_core,
    )?;
    latency.end();
    latency.print(&self.name, "depthwise_conv2d");
    Ok(&self.output)
  }

  fn output(&self) -> &Tensor<T> {
    &self.output
  }

  fn output_mut(&mut self) -> &mut Tensor<T> {
    &mut self.output
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keeps_channel_count_and_mixes_nothing() {
    let data: Vec<i8> = (0..4).flat_map(|_| [2i8, -3]).collect();
    let mut input = Tensor::from_element([2, 2, 2], -1, &data).unwrap();
    let filter = Rc::new(Filter::new(vec![1i8; 2 * 2 * 2], 0, [2, 2, 2, 1]).unwrap());
    let relu = Rc::new(Activation::relu());
    let mut layer = DepthwiseConv2D::new(-1, filter)
      .activation(relu)
      .padding_type(PaddingType::SameMxnet);
    layer.build(&mut input).unwrap();
    assert_eq!(input.padding(), &[1, 0, 1, 0]);
    let output = layer.call(&input, false).unwrap();
    assert_eq!(output.shape(), &[2, 2, 2]);
    // 右下角窗口覆盖全部 4 个像素
    assert_eq!(output.get_element_value([1, 1, 0], false).unwrap(), 8);
    assert_eq!(output.get_element_value([1, 1, 1], false).unwrap(), 0);
    assert_eq!(output.get_element_value([0, 0, 0], false).unwrap(), 2);
  }
}
