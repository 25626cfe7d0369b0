// 该文件是 Shanan （山南西风） 项目的一部分。
// src/layer/avg_pool2d.rs - 平均池化层
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

use crate::{
  error::{DlError, Result},
  layer::Layer,
  nn::{self, AssignCore, PaddingType},
  tool::Latency,
  typedef::{Element, Tensor},
};

#[derive(Debug)]
pub struct AvgPool2D<T: Element> {
  name: String,
  filter_shape: [usize; 2],
  padding_type: PaddingType,
  stride_y: usize,
  stride_x: usize,
  pool_exponent: i32,
  padding: [usize; 4],
  assign_core: AssignCore,
  output: Tensor<T>,
}

impl<T: Element> AvgPool2D<T> {
  pub fn new(output_exponent: i32, filter_shape: [usize; 2]) -> Self {
    let mut output = Tensor::new();
    output.set_exponent(output_exponent);
    Self {
      name: "avg_pool2d".to_string(),
      filter_shape,
      padding_type: PaddingType::Valid,
      stride_y: 1,
      stride_x: 1,
      pool_exponent: T::default_pool_exponent(),
      padding: [0; 4],
      assign_core: AssignCore::default(),
      output,
    }
  }

  pub fn named(mut self, name: &str) -> Self {
    self.name = name.to_string();
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

  pub fn pool_exponent(mut self, pool_exponent: i32) -> Self {
    self.pool_exponent = pool_exponent;
    self
  }

  pub fn assign_core(mut self, assign_core: AssignCore) -> Self {
    self.assign_core = assign_core;
    self
  }
}

impl<T: Element> Layer<T> for AvgPool2D<T> {
  fn name(&self) -> &str {
    &self.name
  }

  fn build(&mut self, input: &mut Tensor<T>) -> Result<()> {
    if input.shape()[0] == 0 || input.shape()[1] == 0 {
      return Err(DlError::invalid(format!("{}: 输入形状为空 {:?}", self.name, input.shape())));
    }
    let output_shape = nn::get_output_shape(
      input.shape(),
      &self.filter_shape,
      self.stride_y,
      self.stride_x,
      self.padding_type,
      false,
    )?;
    if self.output.shape() != &output_shape {
      self.output.free_element();
    }
    self.output.set_shape(output_shape)?;
    self.padding = nn::get_pad_size(
      &output_shape,
      input.shape(),
      &self.filter_shape,
      self.stride_y,
      self.stride_x,
      self.padding_type,
    )?;
    input.require_padding(self.padding)?;
    Ok(())
  }

  fn call(&mut self, input: &Tensor<T>, _autoload_enable: bool) -> Result<&Tensor<T>> {
    let mut latency = Latency::new();
    latency.start();
    self.output.apply_element(T::default())?;
    latency.end();
    latency.print(&self.name, "apply");

    latency.start();
    nn::avg_pool2d(
      &mut self.output,
      input,
      &self.padding,
      self.filter_shape,
      self.stride_y,
      self.stride_x,
      self.pool_exponent,
      self.assign_core,
    )?;
    latency.end();
    latency.print(&self.name, "avg_pool2d");
    Ok(&self.output)
  }

  fn output(&self) -> &Tensor<T> {
    &self.output
  }

  fn output_mut(&mut self) -> &mut Tensor<T> {
    &mut self.output
  }
}
