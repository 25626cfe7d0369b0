// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/conv2d.rs - 定点二维卷积
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

/// 二维卷积
///
/// `padding` 是计算时对输入使用的填充，输入张量自身的填充必须不小于它。
/// 输出张量需已设置形状与指数并申请内存。
#[allow(clippy::too_many_arguments)]
pub fn conv2d<T: Element>(
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
  let [fh, fw, in_c, out_c] = *filter.shape();
  let [dy, dx] = *filter.dilation();
  let [out_h, out_w, output_channel] = *output.shape();
  if input.shape()[2] != in_c {
    return Err(DlError::shape(&[in_c], &[input.shape()[2]]));
  }
  if output_channel != out_c {
    return Err(DlError::shape(&[out_c], &[output_channel]));
  }
  let window = filter.shape_with_dilation();
  check_window(output, input, padding, [window[0], window[1]], stride_y, stride_x)?;

  let requant = Requant::new(
    input.exponent() + filter.exponent(),
    output.exponent(),
    out_c,
    bias,
    activation,
  )?;
  trace!("conv2d: {:?} -> {:?}, {:?}", input.shape(), output.shape(), assign_core);

  let src_layout = PixelLayout::of(input, padding)?;
  let dst_layout = PixelLayout::of(output, &[0; 4])?;
  let src = input.element()?;
  let mut dst = output.element_mut()?;
  let weight = filter.element();

  let mut acc = vec![0i64; out_c];
  for oy in 0..out_h {
    for ox in 0..out_w {
      acc.fill(0);
      for fy in 0..fh {
        for fx in 0..fw {
          let pixel = src_layout.at(oy * stride_y + fy * dy, ox * stride_x + fx * dx);
          for ic in 0..in_c {
            let value = src[pixel + ic].to_i64();
            if value == 0 {
              continue;
            }
            let row = ((fy * fw + fx) * in_c + ic) * out_c;
            for (a, w) in acc.iter_mut().zip(&weight[row..row + out_c]) {
              *a += value * w.to_i64();
            }
          }
        }
      }

      let base = dst_layout.at(oy, ox);
      for (oc, a) in acc.iter().enumerate() {
        dst[base + oc] = requant.finish(*a, oc);
      }
    }
  }
  Ok(())
}

/// 推导输出形状、按需给输入加 SAME 填充、申请输出并计算卷积
#[allow(clippy::too_many_arguments)]
pub fn conv2d_new<T: Element>(
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
    false,
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
  conv2d(
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
  latency.print("nn", "conv2d");
  Ok(output)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_conv_sums_neighbourhood() {
    let mut input = Tensor::<i16>::from_element([3, 3, 1], 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
    let filter = Filter::new(vec![1i16; 9], 0, [3, 3, 1, 1]).unwrap();
    let output = conv2d_new(0, &mut input, &filter, 1, 1, PaddingType::Same, None, None, AssignCore::default())
      .unwrap();
    assert_eq!(output.shape(), &[3, 3, 1]);
    assert_eq!(input.padding(), &[1, 1, 1, 1]);
    assert_eq!(output.to_vec().unwrap(), vec![12, 21, 16, 27, 45, 33, 24, 39, 28]);
  }

  #[test]
  fn valid_conv_with_bias_relu_and_requant() {
    // 两个输入通道、两个输出通道的 1x1 卷积
    let mut input = Tensor::<i8>::from_element([1, 2, 2], -2, &[4, 8, -4, 2]).unwrap();
    // oc0 = ic0 + ic1, oc1 = ic0 - ic1
    let filter = Filter::new(vec![1i8, 1, 1, -1], 0, [1, 1, 2, 2]).unwrap();
    let bias = Bias::new(vec![0i8, 1], 0).unwrap();
    let relu = Activation::relu();
    let output = conv2d_new(
      -1,
      &mut input,
      &filter,
      1,
      1,
      PaddingType::Valid,
      Some(&bias),
      Some(&relu),
      AssignCore::default(),
    )
    .unwrap();
    // 像素 0: (12, -4 + 4) @ -2 -> (6, 0) @ -1
    // 像素 1: (-2, -6 + 4) @ -2 -> (0, 0) @ -1
    assert_eq!(output.to_vec().unwrap(), vec![6, 0, 0, 0]);
  }

  #[test]
  fn output_saturates_instead_of_wrapping() {
    let mut input = Tensor::<i8>::from_element([1, 1, 2], 0, &[100, 100]).unwrap();
    let filter = Filter::new(vec![100i8, -100], 0, [1, 1, 2, 1]).unwrap();
    let positive = conv2d_new(0, &mut input, &filter, 1, 1, PaddingType::Valid, None, None, AssignCore::default());
    // 100*100 + 100*(-100) = 0
    assert_eq!(positive.unwrap().to_vec().unwrap(), vec![0]);

    let filter = Filter::new(vec![100i8, 100], 0, [1, 1, 2, 1]).unwrap();
    let output = conv2d_new(0, &mut input, &filter, 1, 1, PaddingType::Valid, None, None, AssignCore::default())
      .unwrap();
    assert_eq!(output.to_vec().unwrap(), vec![127]);
  }

  #[test]
  fn dilated_filter_skips_pixels() {
    let data: Vec<i16> = (1..=25).collect();
    let mut input = Tensor::from_element([5, 5, 1], 0, &data).unwrap();
    let filter = Filter::with_dilation(vec![1i16; 4], 0, [2, 2, 1, 1], [2, 2]).unwrap();
    let output = conv2d_new(0, &mut input, &filter, 1, 1, PaddingType::Valid, None, None, AssignCore::default())
      .unwrap();
    assert_eq!(output.shape(), &[3, 3, 1]);
    // 1 + 3 + 11 + 13
    assert_eq!(output.get_element_value([0, 0, 0], false).unwrap(), 28);
  }

  #[test]
  fn rejects_insufficient_input_padding() {
    let input = Tensor::<i16>::from_element([2, 2, 1], 0, &[1, 2, 3, 4]).unwrap();
    let filter = Filter::new(vec![1i16; 9], 0, [3, 3, 1, 1]).unwrap();
    let mut output = Tensor::new();
    output.set_shape([2, 2, 1]).unwrap();
    output.calloc_element().unwrap();
    let result = conv2d(&mut output, &input, &[1, 1, 1, 1], &filter, 1, 1, None, None, AssignCore::default());
    assert!(matches!(result, Err(DlError::PaddingTooSmall { .. })));
  }
}
