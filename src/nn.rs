// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn.rs - 定点神经网络算子
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

//! 定点神经网络算子
//!
//! 所有算子遵循同一套数值约定：在 `i64` 中累加，可选地加上偏置、施加激活函数，
//! 最后重新量化到输出张量的指数并饱和截断到元素类型的范围。

mod avg_pool2d;
mod concat2d;
mod conv2d;
mod depthwise_conv2d;

use serde::{Deserialize, Serialize};

use crate::{
  error::{DlError, Result},
  typedef::{Activation, ActivationType, Bias, Element, Tensor, shift_round},
};

pub use self::avg_pool2d::{avg_pool2d, avg_pool2d_new};
pub use self::concat2d::{concat2d, concat2d_new};
pub(crate) use self::concat2d::concat_shape;
pub use self::conv2d::{conv2d, conv2d_new};
pub use self::depthwise_conv2d::{depthwise_conv2d, depthwise_conv2d_new};

/// 填充方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingType {
  /// 不填充，输出按卷积核大小缩小
  #[default]
  Valid,
  /// TensorFlow 风格，奇数的多余填充放在下侧/右侧
  Same,
  /// MXNet 风格，奇数的多余填充放在上侧/左侧
  SameMxnet,
}

impl PaddingType {
  pub fn is_same(&self) -> bool {
    matches!(self, PaddingType::Same | PaddingType::SameMxnet)
  }
}

/// 指定运行算子的核心，目前只作为透传的提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssignCore(pub u8);

/// 计算输出形状
///
/// `filter_shape` 至少含 `[filter_height, filter_width]`；为卷积核时应传入 `shape_with_dilation`。
pub fn get_output_shape(
  input_shape: &[usize; 3],
  filter_shape: &[usize],
  stride_y: usize,
  stride_x: usize,
  pad_type: PaddingType,
  depthwise: bool,
) -> Result<[usize; 3]> {
  if filter_shape.len() < 2 {
    return Err(DlError::invalid(format!(
      "卷积核形状至少需要两维: {:?}",
      filter_shape
    )));
  }
  if stride_y == 0 || stride_x == 0 {
    return Err(DlError::invalid("步长不能为 0"));
  }

  let [height, width, channel] = *input_shape;
  let (fh, fw) = (filter_shape[0], filter_shape[1]);
  let (out_h, out_w) = match pad_type {
    PaddingType::Valid => {
      if fh > height || fw > width {
        return Err(DlError::invalid(format!(
          "VALID 填充下卷积核 {:?} 大于输入 {:?}",
          &filter_shape[..2],
          &input_shape[..2]
        )));
      }
      ((height - fh) / stride_y + 1, (width - fw) / stride_x + 1)
    }
    PaddingType::Same | PaddingType::SameMxnet => {
      (height.div_ceil(stride_y), width.div_ceil(stride_x))
    }
  };

  let out_c = match filter_shape.get(3) {
    Some(&multiplier) if depthwise => channel * multiplier,
    Some(&out_c) => out_c,
    None => channel,
  };
  Ok([out_h, out_w, out_c])
}

/// 实现 `output_shape` 所需的填充 `[top, bottom, left, right]`
pub fn get_pad_size(
  output_shape: &[usize; 3],
  input_shape: &[usize; 3],
  filter_shape: &[usize],
  stride_y: usize,
  stride_x: usize,
  pad_type: PaddingType,
) -> Result<[usize; 4]> {
  if filter_shape.len() < 2 {
    return Err(DlError::invalid(format!(
      "卷积核形状至少需要两维: {:?}",
      filter_shape
    )));
  }

  let total = |out: usize, input: usize, filter: usize, stride: usize| {
    (out.saturating_sub(1) * stride + filter).saturating_sub(input)
  };
  let total_h = total(output_shape[0], input_shape[0], filter_shape[0], stride_y);
  let total_w = total(output_shape[1], input_shape[1], filter_shape[1], stride_x);

  Ok(match pad_type {
    PaddingType::Valid => [0; 4],
    PaddingType::Same => [
      total_h / 2,
      total_h - total_h / 2,
      total_w / 2,
      total_w - total_w / 2,
    ],
    PaddingType::SameMxnet => [
      total_h - total_h / 2,
      total_h / 2,
      total_w - total_w / 2,
      total_w / 2,
    ],
  })
}

/// 张量在某个填充视角下的寻址方式
#[derive(Debug, Clone, Copy)]
pub(crate) struct PixelLayout {
  base: usize,
  row: usize,
  pixel: usize,
}

impl PixelLayout {
  pub(crate) fn of<T: Element>(tensor: &Tensor<T>, padding: &[usize; 4]) -> Result<Self> {
    let [_, width_p, channel_p] = *tensor.shape_with_padding();
    Ok(Self {
      base: tensor.get_element_index(padding)?,
      row: width_p * channel_p,
      pixel: channel_p,
    })
  }

  #[inline(always)]
  pub(crate) fn at(&self, y: usize, x: usize) -> usize {
    self.base + y * self.row + x * self.pixel
  }
}

/// 检查输入在 `padding` 下能否容纳输出所需的全部窗口
pub(crate) fn check_window<T: Element>(
  output: &Tensor<T>,
  input: &Tensor<T>,
  padding: &[usize; 4],
  window: [usize; 2],
  stride_y: usize,
  stride_x: usize,
) -> Result<()> {
  if stride_y == 0 || stride_x == 0 {
    return Err(DlError::invalid("步长不能为 0"));
  }
  let [out_h, out_w, _] = *output.shape();
  let [in_h, in_w, _] = *input.shape();
  let need_h = out_h.saturating_sub(1) * stride_y + window[0];
  let need_w = out_w.saturating_sub(1) * stride_x + window[1];
  let have_h = padding[0] + in_h + padding[1];
  let have_w = padding[2] + in_w + padding[3];
  if out_h > 0 && out_w > 0 && (need_h > have_h || need_w > have_w) {
    return Err(DlError::shape(&[need_h, need_w], &[have_h, have_w]));
  }
  Ok(())
}

/// 累加结果的收尾：偏置、激活、重新量化
pub(crate) struct Requant<'a, T: Element> {
  accumulate_exponent: i32,
  output_exponent: i32,
  bias: Option<&'a Bias<T>>,
  activation: Option<&'a Activation<T>>,
}

impl<'a, T: Element> Requant<'a, T> {
  pub(crate) fn new(
    accumulate_exponent: i32,
    output_exponent: i32,
    output_channel: usize,
    bias: Option<&'a Bias<T>>,
    activation: Option<&'a Activation<T>>,
  ) -> Result<Self> {
    if let Some(bias) = bias
      && bias.len() != output_channel
    {
      return Err(DlError::shape(&[output_channel], &[bias.len()]));
    }
    if let Some(activation) = activation
      && activation.activation_type() == ActivationType::PReLU
      && activation.len() != output_channel
    {
      return Err(DlError::shape(&[output_channel], &[activation.len()]));
    }
    Ok(Self {
      accumulate_exponent,
      output_exponent,
      bias,
      activation,
    })
  }

  #[inline(always)]
  pub(crate) fn finish(&self, mut acc: i64, channel: usize) -> T {
    if let Some(bias) = self.bias {
      acc = acc.saturating_add(shift_round(
        bias.element()[channel].to_i64(),
        bias.exponent() - self.accumulate_exponent,
      ));
    }

    if let Some(activation) = self.activation {
      match activation.activation_type() {
        ActivationType::Linear => {}
        ActivationType::ReLU => acc = acc.max(0),
        ActivationType::LeakyReLU | ActivationType::PReLU => {
          if acc < 0 {
            acc = shift_round(
              acc.saturating_mul(activation.slope(channel)),
              activation.exponent(),
            );
          }
        }
      }
    }

    T::saturate(shift_round(
      acc,
      self.accumulate_exponent - self.output_exponent,
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn requant_saturates_large_bias_and_slope() {
    // 偏置指数远大于累加指数时，对齐后的偏置接近 i64::MAX
    let bias = Bias::new(vec![i16::MAX], 62).unwrap();
    let requant = Requant::<i16>::new(0, 0, 1, Some(&bias), None).unwrap();
    assert_eq!(requant.finish(1000, 0), i16::MAX);

    let leaky = Activation::leaky_relu(4i16, -2);
    let requant = Requant::<i16>::new(0, 0, 1, None, Some(&leaky)).unwrap();
    assert_eq!(requant.finish(-(1i64 << 62), 0), i16::MIN);
    assert_eq!(requant.finish(-8, 0), -8);
  }

  #[test]
  fn same_output_is_ceil_of_input_over_stride() {
    for input in 1..20usize {
      for filter in 1..6usize {
        for stride in 1..4usize {
          for pad_type in [PaddingType::Same, PaddingType::SameMxnet] {
            let input_shape = [input, input + 1, 3];
            let filter_shape = [filter, filter, 3, 8];
            let output =
              get_output_shape(&input_shape, &filter_shape, stride, stride, pad_type, false)
                .unwrap();
            assert_eq!(output[0], input.div_ceil(stride));
            assert_eq!(output[2], 8);

            let pad = get_pad_size(&output, &input_shape, &filter_shape, stride, stride, pad_type)
              .unwrap();
            // 在 VALID 公式下重新得到同样的输出
            let padded = [pad[0] + input + pad[1], pad[2] + input + 1 + pad[3], 3];
            let valid = get_output_shape(
              &padded,
              &filter_shape,
              stride,
              stride,
              PaddingType::Valid,
              false,
            )
            .unwrap();
            assert_eq!(valid, output);
          }
        }
      }
    }
  }

  #[test]
  fn odd_padding_split_differs_by_style() {
    let input_shape = [4, 4, 1];
    let filter_shape = [4, 4, 1, 1];
    let output = get_output_shape(&input_shape, &filter_shape, 1, 1, PaddingType::Same, false).unwrap();
    assert_eq!(
      get_pad_size(&output, &input_shape, &filter_shape, 1, 1, PaddingType::Same).unwrap(),
      [1, 2, 1, 2]
    );
    assert_eq!(
      get_pad_size(&output, &input_shape, &filter_shape, 1, 1, PaddingType::SameMxnet).unwrap(),
      [2, 1, 2, 1]
    );
  }

  #[test]
  fn valid_output_shrinks_by_filter() {
    let output = get_output_shape(&[7, 9, 2], &[3, 3, 2, 5], 2, 2, PaddingType::Valid, false).unwrap();
    assert_eq!(output, [3, 4, 5]);
    assert_eq!(
      get_pad_size(&output, &[7, 9, 2], &[3, 3], 2, 2, PaddingType::Valid).unwrap(),
      [0; 4]
    );
  }

  #[test]
  fn depthwise_and_pool_keep_channel() {
    let depthwise = get_output_shape(&[8, 8, 6], &[3, 3, 6, 1], 1, 1, PaddingType::Same, true).unwrap();
    assert_eq!(depthwise, [8, 8, 6]);
    let pool = get_output_shape(&[8, 8, 6], &[2, 2], 2, 2, PaddingType::Valid, false).unwrap();
    assert_eq!(pool, [4, 4, 6]);
  }

  #[test]
  fn rejects_oversized_valid_filter_and_zero_stride() {
    assert!(get_output_shape(&[2, 2, 1], &[3, 3, 1, 1], 1, 1, PaddingType::Valid, false).is_err());
    assert!(get_output_shape(&[2, 2, 1], &[1, 1, 1, 1], 0, 1, PaddingType::Same, false).is_err());
  }

  #[test]
  fn requant_adds_bias_activates_and_saturates() {
    let bias = Bias::<i8>::new(vec![4i8, -4], -2).unwrap();
    let leaky = Activation::<i8>::leaky_relu(64, -7);
    let requant = Requant::new(-4, -4, 2, Some(&bias), Some(&leaky)).unwrap();
    // bias 4 * 2^-2 = 1.0 -> 16 @ -4
    assert_eq!(requant.finish(10, 0), 26);
    // (10 - 16) * 0.5 = -3
    assert_eq!(requant.finish(10, 1), -3);
    assert_eq!(requant.finish(1000, 0), 127);

    let relu = Activation::<i8>::relu();
    let requant = Requant::new(-6, -4, 2, None, Some(&relu)).unwrap();
    assert_eq!(requant.finish(-40, 0), 0);
    // 10 / 4 = 2.5 -> 3
    assert_eq!(requant.finish(10, 1), 3);
  }
}
