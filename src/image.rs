// 该文件是 Shanan （山南西风） 项目的一部分。
// src/image.rs - 原始像素缓冲区的转换、缩放与绘制
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

mod draw;
mod resize;

use serde::{Deserialize, Serialize};

use crate::error::{DlError, Result};

pub use self::draw::{draw_point, draw_rectangle};
pub use self::resize::crop_and_resize;

/// 缩放时的取样方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeType {
  /// 四个相邻像素的双线性插值
  Bilinear,
  /// 四个相邻像素的均值
  Mean,
  /// 最近的像素
  #[default]
  Nearest,
}

/// 可按坐标读取像素的图像
pub trait ImageSource {
  fn height(&self) -> usize;
  fn width(&self) -> usize;
  /// 1 或 3
  fn channel(&self) -> usize;
  /// 把 `(y, x)` 处的像素写入 `pixel` 的前 `channel()` 项，坐标保证在图像内
  fn pixel(&self, y: usize, x: usize, pixel: &mut [i32; 3]);

  fn shape(&self) -> [usize; 3] {
    [self.height(), self.width(), self.channel()]
  }
}

/// 交织排列的 8 位图像
#[derive(Debug, Clone, Copy)]
pub struct RawImage<'a> {
  data: &'a [u8],
  height: usize,
  width: usize,
  channel: usize,
}

impl<'a> RawImage<'a> {
  pub fn new(data: &'a [u8], shape: [usize; 3]) -> Result<Self> {
    let [height, width, channel] = shape;
    if channel != 1 && channel != 3 {
      return Err(DlError::invalid(format!("只支持 1 或 3 通道图像: {}", channel)));
    }
    if data.len() != height * width * channel {
      return Err(DlError::shape(&[height * width * channel], &[data.len()]));
    }
    Ok(Self {
      data,
      height,
      width,
      channel,
    })
  }
}

impl ImageSource for RawImage<'_> {
  fn height(&self) -> usize {
    self.height
  }

  fn width(&self) -> usize {
    self.width
  }

  fn channel(&self) -> usize {
    self.channel
  }

  #[inline]
  fn pixel(&self, y: usize, x: usize, pixel: &mut [i32; 3]) {
    let base = (y * self.width + x) * self.channel;
    for (p, v) in pixel.iter_mut().zip(&self.data[base..base + self.channel]) {
      *p = *v as i32;
    }
  }
}

/// 摄像头字节序的 RGB565 图像，读出的三个通道依次为蓝、绿、红
#[derive(Debug, Clone, Copy)]
pub struct Rgb565Image<'a> {
  data: &'a [u16],
  height: usize,
  width: usize,
}

impl<'a> Rgb565Image<'a> {
  pub fn new(data: &'a [u16], height: usize, width: usize) -> Result<Self> {
    if data.len() != height * width {
      return Err(DlError::shape(&[height * width], &[data.len()]));
    }
    Ok(Self {
      data,
      height,
      width,
    })
  }
}

impl ImageSource for Rgb565Image<'_> {
  fn height(&self) -> usize {
    self.height
  }

  fn width(&self) -> usize {
    self.width
  }

  fn channel(&self) -> usize {
    3
  }

  #[inline]
  fn pixel(&self, y: usize, x: usize, pixel: &mut [i32; 3]) {
    let bgr = convert_pixel_rgb565_to_rgb888(self.data[y * self.width + x]);
    for (p, v) in pixel.iter_mut().zip(bgr) {
      *p = v as i32;
    }
  }
}

/// 把高低字节交换过的 RGB565 像素转换为 `[blue, green, red]`
#[inline]
pub fn convert_pixel_rgb565_to_rgb888(input: u16) -> [u8; 3] {
  [
    ((input & 0x1F00) >> 5) as u8,
    (((input & 0x7) << 5) | ((input & 0xE000) >> 11)) as u8,
    (input & 0xF8) as u8,
  ]
}

#[inline]
pub fn convert_pixel_rgb_to_gray(red: i32, green: i32, blue: i32) -> i32 {
  ((red * 38 + green * 75 + blue * 15) >> 7).clamp(0, 255)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rgb565_in_camera_byte_order() {
    // 纯红 0xF800，字节交换后为 0x00F8
    assert_eq!(convert_pixel_rgb565_to_rgb888(0x00F8), [0, 0, 0xF8]);
    // 纯蓝 0x001F，字节交换后为 0x1F00
    assert_eq!(convert_pixel_rgb565_to_rgb888(0x1F00), [0xF8, 0, 0]);
    // 纯绿 0x07E0，字节交换后为 0xE007
    assert_eq!(convert_pixel_rgb565_to_rgb888(0xE007), [0, 0xFC, 0]);
  }

  #[test]
  fn gray_is_weighted_and_clipped() {
    assert_eq!(convert_pixel_rgb_to_gray(0, 0, 0), 0);
    assert_eq!(convert_pixel_rgb_to_gray(255, 255, 255), 255);
    assert_eq!(convert_pixel_rgb_to_gray(128, 0, 0), 38);
  }

  #[test]
  fn raw_image_checks_shape() {
    let data = [0u8; 12];
    assert!(RawImage::new(&data, [2, 2, 3]).is_ok());
    assert!(RawImage::new(&data, [2, 3, 2]).is_err());
    assert!(RawImage::new(&data, [3, 3, 1]).is_err());
  }
}
