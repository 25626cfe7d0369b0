// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/avg_pool2d.rs - 定点平均池化
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

use super::{AssignCore, PaddingType, PixelLayout, check_window, get_output_shape, get_pad_size};
use crate::{
  error::{DlError, Result},
  tool::Latency,
  typedef::{Element, Tensor, shift_round},
};

/// 平均池化
///
/// 窗口内求和后乘以倒数 `round(2^-pool_exponent / (fh * fw))`，
/// 所得结果的指数为 `input.exponent + pool_exponent`，再重新量化到输出指数。
#[allow(clippy::too_many_arguments)]
pub fn avg_pool2d<T: Element>(
  output: &mut Tensor<T>,
  input: &Tensor<T>,
  padding: &[usize; 4],
  filter_shape: [usize; 2],
  stride_y: usize,
  stride_x: usize,
  pool_exponent: i32,
  assign_core: AssignCore,
) -> Result<()> {
  let [fh, fw] = filter_shape;
  if fh == 0 || fw == 0 {
    return Err(DlError::invalid(format!("池化窗口不能为 0: {:?}", filter_shape)));
  }
  let [out_h, out_w, channel] = *output.shape();
  if input.shape()[2] != channel {
    return Err(DlError::shape(&[channel], &[input.shape()[2]]));
  }
  check_window(output, input, padding, filter_shape, stride_y, stride_x)?;

  let reciprocal = (2f64.powi(-pool_exponent) / (fh * fw) as f64).round() as i64;
  let shift = input.exponent() + pool_exponent - output.exponent();
  trace!(
    "avg_pool2d: {:?} -> {:?}, reciprocal = {}, {:?}",
    input.shape(),
    output.shape(),
    reciprocal,
    assign_core
  );

  let src_layout = PixelLayout::of(input, padding)?;
  let dst_layout = PixelLayout::of(output, &[0; 4])?;
  let src = input.element()?;
  let mut dst = output.element_mut()?;

  let mut acc = vec![0i64; channel];
  for oy in 0..out_h {
    for ox in 0..out_w {
      acc.fill(0);
      for fy in 0..fh {
        for fx in 0..fw {
          let pixel = src_layout.at(oy * stride_y + fy, ox * stride_x + fx);
          for (c, a) in acc.iter_mut().enumerate() {
            *a += src[pixel + c].to_i64();
          }
        }
      }

      let base = dst_layout.at(oy, ox);
      for (c, a) in acc.iter().enumerate() {
        dst[base + c] = T::saturate(shift_round(a * reciprocal, shift));
      }
    }
  }
  Ok(())
}

/// `pool_exponent` 为 `None` 时使用 `2 - bits(T)`
#[allow(clippy::too_many_arguments)]
pub fn avg_pool2d_new<T: Element>(
  output_exponent: i32,
  input: &mut Tensor<T>,
  filter_shape: [usize; 2],
  stride_y: usize,
  stride_x: usize,
  pad_type: PaddingType,
  pool_exponent: Option<i32>,
  assign_core: AssignCore,
) -> Result<Tensor<T>> {
  let mut latency = Latency::new();
  latency.start();
  let output_shape = get_output_shape(
    input.shape(),
    &filter_shape,
    stride_y,
    stride_x,
    pad_type,
    false,
  )?;
  let mut output = Tensor::with_allocator(input.allocator().clone());
  output.set_exponent(output_exponent).set_shape(output_shape)?;
  output.apply_element(T::default())?;
  latency.end();
  latency.print("nn", "apply");

  latency.start();
  let padding = get_pad_size(
    &output_shape,
    input.shape(),
    &filter_shape,
    stride_y,
    stride_x,
    pad_type,
  )?;
  if pad_type.is_same() {
    input.require_padding(padding)?;
  }
  latency.end();
  latency.print("nn", "padding");

  latency.start();
  avg_pool2d(
    &mut output,
    input,
    &padding,
    filter_shape,
    stride_y,
    stride_x,
    pool_exponent.unwrap_or_else(T::default_pool_exponent),
    assign_core,
  )?;
  latency.end();
  latency.print("nn", "avg_pool2d");
  Ok(output)
}
