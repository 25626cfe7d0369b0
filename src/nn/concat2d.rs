// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/concat2d.rs - 沿通道拼接
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

use super::PixelLayout;
use crate::{
  error::{DlError, Result},
  typedef::{Element, Tensor},
};

/// 检查各分支能否拼接，返回拼接后的形状
pub(crate) fn concat_shape<T: Element>(features: &[&Tensor<T>]) -> Result<[usize; 3]> {
  let first = features
    .first()
    .ok_or_else(|| DlError::invalid("拼接至少需要一个输入"))?;
  let [height, width, _] = *first.shape();
  let mut channel = 0;
  for feature in features {
    let shape = feature.shape();
    if shape[0] != height || shape[1] != width {
      return Err(DlError::shape(&[height, width], &shape[..2]));
    }
    if feature.exponent() != first.exponent() {
      return Err(DlError::ExponentMismatch {
        expected: first.exponent(),
        actual: feature.exponent(),
      });
    }
    channel += shape[2];
  }
  Ok([height, width, channel])
}

/// 沿通道把 `features` 依次写入 `output`
///
/// 已经是 `output` 对应通道偏移处视图的分支不需要复制，直接跳过。
pub fn concat2d<T: Element>(output: &mut Tensor<T>, features: &[&Tensor<T>]) -> Result<()> {
  let shape = concat_shape(features)?;
  if output.shape() != &shape {
    return Err(DlError::shape(&shape, output.shape()));
  }
  if output.exponent() != features[0].exponent() {
    return Err(DlError::ExponentMismatch {
      expected: features[0].exponent(),
      actual: output.exponent(),
    });
  }

  let [height, width, _] = shape;
  let dst_layout = PixelLayout::of(output, &[0; 4])?;
  let mut channel_offset = 0;
  for feature in features {
    let channel = feature.shape()[2];
    if feature.is_view_of(output, channel_offset) {
      trace!("concat2d: 跳过通道偏移 {} 处的视图", channel_offset);
      channel_offset += channel;
      continue;
    }

    let src_layout = PixelLayout::of(*feature, &[0; 4])?;
    let src = feature.element()?;
    let mut dst = output.element_mut()?;
    for y in 0..height {
      for x in 0..width {
        let s = src_layout.at(y, x);
        let d = dst_layout.at(y, x) + channel_offset;
        dst[d..d + channel].copy_from_slice(&src[s..s + channel]);
      }
    }
    channel_offset += channel;
  }
  Ok(())
}

/// 申请拼接结果并复制所有分支
pub fn concat2d_new<T: Element>(features: &[&Tensor<T>]) -> Result<Tensor<T>> {
  let shape = concat_shape(features)?;
  let mut output = Tensor::with_allocator(features[0].allocator().clone());
  output.set_exponent(features[0].exponent()).set_shape(shape)?;
  output.calloc_element()?;
  concat2d(&mut output, features)?;
  Ok(output)
}
