// 该文件是 Shanan （山南西风） 项目的一部分。
// src/image/resize.rs - 裁剪并缩放到量化缓冲区
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

use std::ops::Range;

use super::{ImageSource, ResizeType, convert_pixel_rgb_to_gray};
use crate::{
  error::{DlError, Result},
  typedef::{Element, shift_round},
};

/// 源图像上的取样器，越界坐标钳制到最近的边缘像素
struct Sampler<'a, S: ImageSource + ?Sized> {
  source: &'a S,
  max_y: i64,
  max_x: i64,
}

impl<'a, S: ImageSource + ?Sized> Sampler<'a, S> {
  fn new(source: &'a S) -> Self {
    Self {
      source,
      max_y: source.height() as i64 - 1,
      max_x: source.width() as i64 - 1,
    }
  }

  #[inline]
  fn read(&self, y: i64, x: i64, pixel: &mut [i32; 3]) {
    let y = y.clamp(0, self.max_y) as usize;
    let x = x.clamp(0, self.max_x) as usize;
    self.source.pixel(y, x, pixel);
  }
}

/// 把源图像的裁剪区域缩放到目标缓冲区的窗口内
///
/// - `dst` 为交织排列的目标缓冲区，行宽 `dst_width` 像素、每像素 `dst_channel` 项；
/// - 只写入 `dst_y × dst_x` 窗口，窗口外（例如张量的填充边框）保持不变；
/// - 裁剪区域可以超出源图像，越界部分取最近的边缘像素；
/// - 3 通道源写入 1 通道目标时转灰度，1 通道源写入 3 通道目标时复制；
/// - 像素值左移 `shift_left` 位（负数为右移）后饱和写入。
#[allow(clippy::too_many_arguments)]
pub fn crop_and_resize<T: Element, S: ImageSource + ?Sized>(
  dst: &mut [T],
  dst_width: usize,
  dst_channel: usize,
  dst_y: Range<usize>,
  dst_x: Range<usize>,
  source: &S,
  src_y: Range<i64>,
  src_x: Range<i64>,
  resize_type: ResizeType,
  shift_left: i32,
) -> Result<()> {
  if source.height() == 0 || source.width() == 0 {
    return Err(DlError::invalid("源图像为空"));
  }
  if src_y.is_empty() || src_x.is_empty() {
    return Err(DlError::invalid(format!("裁剪区域为空: {:?} x {:?}", src_y, src_x)));
  }
  if dst_x.end > dst_width {
    return Err(DlError::IndexOutOfRange {
      index: vec![dst_x.end],
      bound: vec![dst_width],
    });
  }
  if dst_y.end * dst_width * dst_channel > dst.len() {
    return Err(DlError::shape(&[dst_y.end * dst_width * dst_channel], &[dst.len()]));
  }
  let src_channel = source.channel();
  let convert: fn(&[i32; 3], &mut [i32; 3]) = match (src_channel, dst_channel) {
    (3, 3) | (1, 1) => |p, o| *o = *p,
    (3, 1) => |p, o| o[0] = convert_pixel_rgb_to_gray(p[0], p[1], p[2]),
    (1, 3) => |p, o| *o = [p[0]; 3],
    _ => {
      return Err(DlError::invalid(format!(
        "不支持从 {} 通道转换为 {} 通道",
        src_channel, dst_channel
      )));
    }
  };

  if dst_y.is_empty() || dst_x.is_empty() {
    return Ok(());
  }

  let sampler = Sampler::new(source);
  let scale_y = (src_y.end - src_y.start) as f32 / dst_y.len() as f32;
  let scale_x = (src_x.end - src_x.start) as f32 / dst_x.len() as f32;

  let mut pixel = [0i32; 3];
  let mut converted = [0i32; 3];
  for (iy, y) in dst_y.clone().enumerate() {
    for (ix, x) in dst_x.clone().enumerate() {
      match resize_type {
        ResizeType::Nearest => {
          let sy = src_y.start + (iy as f32 * scale_y) as i64;
          let sx = src_x.start + (ix as f32 * scale_x) as i64;
          sampler.read(sy, sx, &mut pixel);
        }
        ResizeType::Mean => {
          let sy = src_y.start + (iy as f32 * scale_y) as i64;
          let sx = src_x.start + (ix as f32 * scale_x) as i64;
          let mut sum = [0i32; 3];
          let mut corner = [0i32; 3];
          for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            sampler.read(sy + dy, sx + dx, &mut corner);
            for (s, c) in sum.iter_mut().zip(corner) {
              *s += c;
            }
          }
          for (p, s) in pixel.iter_mut().zip(sum) {
            *p = s >> 2;
          }
        }
        ResizeType::Bilinear => {
          let fy = (iy as f32 + 0.5) * scale_y - 0.5 + src_y.start as f32;
          let fx = (ix as f32 + 0.5) * scale_x - 0.5 + src_x.start as f32;
          let (y0, x0) = (fy.floor(), fx.floor());
          let (wy, wx) = (fy - y0, fx - x0);
          let (y0, x0) = (y0 as i64, x0 as i64);
          let mut value = [0f32; 3];
          let mut corner = [0i32; 3];
          for (dy, dx, w) in [
            (0, 0, (1.0 - wy) * (1.0 - wx)),
            (0, 1, (1.0 - wy) * wx),
            (1, 0, wy * (1.0 - wx)),
            (1, 1, wy * wx),
          ] {
            sampler.read(y0 + dy, x0 + dx, &mut corner);
            for (v, c) in value.iter_mut().zip(corner) {
              *v += c as f32 * w;
            }
          }
          for (p, v) in pixel.iter_mut().zip(value) {
            *p = v.round() as i32;
          }
        }
      }

      convert(&pixel, &mut converted);
      let base = (y * dst_width + x) * dst_channel;
      for (d, v) in dst[base..base + dst_channel].iter_mut().zip(converted) {
        *d = T::saturate(shift_round(v as i64, shift_left));
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::RawImage;

  #[test]
  fn crop_outside_source_replicates_edge() {
    let data: Vec<u8> = (1..=9).collect();
    let source = RawImage::new(&data, [3, 3, 1]).unwrap();
    // 目标 4x4，窗口在 [1, 3) x [1, 3)，边框填 -1
    let mut dst = vec![-1i16; 16];
    crop_and_resize(
      &mut dst,
      4,
      1,
      1..3,
      1..3,
      &source,
      10..14,
      -8..-4,
      ResizeType::Nearest,
      0,
    )
    .unwrap();
    // 左下角像素 (2, 0) = 7
    assert_eq!(
      dst,
      vec![-1, -1, -1, -1, -1, 7, 7, -1, -1, 7, 7, -1, -1, -1, -1, -1]
    );
  }

  #[test]
  fn nearest_downscale_and_shift() {
    let data: Vec<u8> = (0..16).collect();
    let source = RawImage::new(&data, [4, 4, 1]).unwrap();
    let mut dst = vec![0i8; 4];
    crop_and_resize(&mut dst, 2, 1, 0..2, 0..2, &source, 0..4, 0..4, ResizeType::Nearest, -1).unwrap();
    // 取 (0,0) (0,2) (2,0) (2,2)，再右移一位
    assert_eq!(dst, vec![0, 1, 4, 5]);
  }

  #[test]
  fn mean_averages_four_neighbours() {
    let data: Vec<u8> = vec![0, 4, 8, 12];
    let source = RawImage::new(&data, [2, 2, 1]).unwrap();
    let mut dst = vec![0i16; 1];
    crop_and_resize(&mut dst, 1, 1, 0..1, 0..1, &source, 0..2, 0..2, ResizeType::Mean, 0).unwrap();
    assert_eq!(dst, vec![6]);
  }

  #[test]
  fn bilinear_identity_when_scale_is_one() {
    let data: Vec<u8> = (10..19).collect();
    let source = RawImage::new(&data, [3, 3, 1]).unwrap();
    let mut dst = vec![0i16; 9];
    crop_and_resize(&mut dst, 3, 1, 0..3, 0..3, &source, 0..3, 0..3, ResizeType::Bilinear, 0).unwrap();
    assert_eq!(dst, (10..19).collect::<Vec<i16>>());
  }

  #[test]
  fn converts_rgb_to_gray_and_gray_to_rgb() {
    let rgb = [255u8, 255, 255];
    let source = RawImage::new(&rgb, [1, 1, 3]).unwrap();
    let mut gray = vec![0i16; 1];
    crop_and_resize(&mut gray, 1, 1, 0..1, 0..1, &source, 0..1, 0..1, ResizeType::Nearest, 0).unwrap();
    assert_eq!(gray, vec![255]);

    let mono = [7u8];
    let source = RawImage::new(&mono, [1, 1, 1]).unwrap();
    let mut color = vec![0i16; 3];
    crop_and_resize(&mut color, 1, 3, 0..1, 0..1, &source, 0..1, 0..1, ResizeType::Nearest, 0).unwrap();
    assert_eq!(color, vec![7, 7, 7]);
  }
}
