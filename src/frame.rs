// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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
  image::ImageSource,
};

const RGB_CHANNELS: usize = 3;

/// 交织排列的 8 位 RGB 帧，大小在运行时决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNhwcFrame {
  data: Box<[u8]>,
  height: usize,
  width: usize,
}

impl RgbNhwcFrame {
  pub fn with_shape(height: usize, width: usize) -> Self {
    Self {
      data: vec![0u8; height * width * RGB_CHANNELS].into_boxed_slice(),
      height,
      width,
    }
  }

  pub fn from_raw(data: Vec<u8>, height: usize, width: usize) -> Result<Self> {
    if data.len() != height * width * RGB_CHANNELS {
      return Err(DlError::shape(
        &[height * width * RGB_CHANNELS],
        &[data.len()],
      ));
    }
    Ok(Self {
      data: data.into_boxed_slice(),
      height,
      width,
    })
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}

impl AsRef<[u8]> for RgbNhwcFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for RgbNhwcFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl ImageSource for RgbNhwcFrame {
  fn height(&self) -> usize {
    self.height
  }

  fn width(&self) -> usize {
    self.width
  }

  fn channel(&self) -> usize {
    RGB_CHANNELS
  }

  #[inline]
  fn pixel(&self, y: usize, x: usize, pixel: &mut [i32; 3]) {
    let base = (y * self.width + x) * RGB_CHANNELS;
    for (p, v) in pixel.iter_mut().zip(&self.data[base..base + RGB_CHANNELS]) {
      *p = *v as i32;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_reads_interleaved_pixels() {
    let frame = RgbNhwcFrame::from_raw((0..12).collect(), 2, 2).unwrap();
    let mut pixel = [0; 3];
    frame.pixel(1, 0, &mut pixel);
    assert_eq!(pixel, [6, 7, 8]);
    assert_eq!(frame.shape(), [2, 2, 3]);
    assert!(RgbNhwcFrame::from_raw(vec![0; 11], 2, 2).is_err());
  }
}
