// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/depthwise_conv2d.rs - 定点逐通道卷积
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

use tracing::trace;

use super::{AssignCore, PaddingType, PixelLayout, Requant, check_window, get_output_shape, get_pad_size};
use crate::{
  error::{DlError, Result},
  tool::Latency,
  typedef::{Activation, Bias, Element, Filter, Tensor},
};

/// 逐通道卷积，卷积核形状为 `[filter_height, filter_width, channel, 1]`
#[allow(clippy::too_many_arguments)]
pub fn depthwise_conv2d<T: Element>(
  output: &mut Tensor<T>,
  input: &Tensor<T>,
  padding: &[usize; 4],
  filter: &Filter<T>,
  stride_y: usize,
  stride_x: usize,
  bias: Option<&Bias<T>>,
  activation: Option<&Activation<T>>,
  assign_core: AssignCore,
) -> Result<()> {
  let [fh, fw, channel, multiplier] = *filter.shape();
  let [dy, dx] = *filter.dilation();
  if multiplier != 1 {
    return Err(DlError::invalid(format!(
      "逐通道卷积核的最后一维必须为 1: {:?}",
      filter.shape()
    )));
  }
  if input.shape()[2] != channel {
    return Err(DlError::shape(&[channel], &[input.shape()[2]]));
  }
  let [out_h, out_w, out_c] = *output.shape();
  if out_c != channel {
    return Err(DlError::shape(&[channel], &[out_c]));
  }
  let window = filter.shape_with_dilation();
  check_window(output, input, padding, [window[0], window[1]], stride_y, stride_x)?;

  let requant = Requant::new(
    input.exponent() + filter.exponent(),
    output.exponent(),
    channel,
    bias,
    activation,
  )?;
  trace!(
    "depthwise_conv2d: {:?} -> {:?}, {:?}",
    input.shape(),
    output.shape(),
    assign_core
  );

  let src_layout = PixelLayout::of(input, padding)?;
  let dst_layout = PixelLayout::of(output, &[0; 4])?;
  let src = input.element()?;
  let mut dst = output.element_mut()?;
  let weight = filter.element();

  let mut acc = vec![0i64; channel];
  for oy in 0..out_h {
    for ox in 0..out_w {
      acc.fill(0);
      for fy in 0..fh {
        for fx in 0..fw {
          let pixel = src_layout.at(oy * stride_y + fy * dy, ox * stride_x + fx * dx);
          let row = (fy * fw + fx) * channel;
          for (c, a) in acc.iter_mut().enumerate() {
            *a += src[pixel + c].to_i64() * weight[row + c].to_i64();
          }
        }
      }

      let base = dst_layout.at(oy, ox);
      for (c, a) in acc.iter().enumerate() {
        dst[base + c] = requant.finish(*a, c);
      }
    }
  }
  Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn depthwise_conv2d_new<T: Element>(
  output_exponent: i32,
  input: &mut Tensor<T>,
  filter: &Filter<T>,
  stride_y: usize,
  stride_x: usize,
  pad_type: PaddingType,
  bias: Option<&Bias<T>>,
  activation: Option<&Activation<T>>,
  assign_core: AssignCore,
) -> Result<Tensor<T>> {
  let mut latency = Latency::new();
  latency.start();
  let output_shape = get_output_shape(
    input.shape(),
    filter.shape_with_dilation(),
    stride_y,
    stride_x,
    pad_type,
    true,
  )?;
  let mut output = Tensor::with_allocator(input.allocator().clone());
  output.set_exponent(output_exponent).set_shape(output_shape)?;
  output.calloc_element()?;
  latency.end();
  latency.print("nn", "set_shape");

  latency.start();
  let padding = get_pad_size(
    &output_shape,
    input.shape(),
    filter.shape_with_dilation(),
    stride_y,
    stride_x,
    pad_type,
  )?;
  if pad_type.is_same() {
    input.require_padding(padding)?;
  }
  latency.end();
  latency.print("nn", "set_padding");

  latency.start();
  depthwise_conv2d(
    &mut output,
    input,
    &padding,
    filter,
    stride_y,
    stride_x,
    bias,
    activation,
    assign_core,
  )?;
  latency.end();
  latency.print("nn", "depthwise_conv2d");
  Ok(output)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channels_do_not_mix() {
    // 通道 0 全为 1，通道 1 全为 10
    let data: Vec<i16> = (0..9).flat_map(|_| [1i16, 10]).collect();
    let mut input = Tensor::from_element([3, 3, 2], 0, &data).unwrap();
    // 通道 0 权重 1，通道 1 权重 -1
    let weight: Vec<i16> = (0..9).flat_map(|_| [1i16, -1]).collect();
    let filter = Filter::new(weight, 0, [3, 3, 2, 1]).unwrap();
    let output = depthwise_conv2d_new(
      0,
      &mut input,
      &filter,
      1,
      1,
      PaddingType::Same,
      None,
      None,
      AssignCore::default(),
    )
    .unwrap();
    assert_eq!(output.shape(), &[3, 3, 2]);
    assert_eq!(output.get_element_value([1, 1, 0], false).unwrap(), 9);
    assert_eq!(output.get_element_value([1, 1, 1], false).unwrap(), -90);
    assert_eq!(output.get_element_value([0, 0, 0], false).unwrap(), 4);
    assert_eq!(output.get_element_value([0, 0, 1], false).unwrap(), -40);
  }

  #[test]
  fn prelu_uses_per_channel_slope() {
    let mut input = Tensor::<i8>::from_element([1, 1, 2], 0, &[-8, -8]).unwrap();
    let filter = Filter::new(vec![1i8, 1], 0, [1, 1, 2, 1]).unwrap();
    // 斜率 0.5 与 0.25
    let prelu = Activation::prelu(vec![2i8, 1], -2).unwrap();
    let output = depthwise_conv2d_new(
      0,
      &mut input,
      &filter,
      1,
      1,
      PaddingType::Valid,
      None,
      Some(&prelu),
      AssignCore::default(),
    )
    .unwrap();
    assert_eq!(output.to_vec().unwrap(), vec![-4, -2]);
  }

  #[test]
  fn rejects_channel_multiplier() {
    let mut input = Tensor::<i8>::from_element([1, 1, 1], 0, &[1]).unwrap();
    let filter = Filter::new(vec![1i8, 1], 0, [1, 1, 1, 2]).unwrap();
    let result = depthwise_conv2d_new(
      0,
      &mut input,
      &filter,
      1,
      1,
      PaddingType::Valid,
      None,
      None,
      AssignCore::default(),
    );
    assert!(result.is_err());
  }
}
