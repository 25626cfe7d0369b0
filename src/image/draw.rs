// 该文件是 Shanan （山南西风） 项目的一部分。
// src/image/draw.rs - 在原始缓冲区上绘制矩形与点
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

/// 画一像素宽的矩形边框，`color` 的长度即每像素的元素数，坐标会被钳制到图像内
///
/// 适用于 `u16` 的 RGB565 缓冲区（`color` 长度为 1）或 `u8` 的 RGB888 缓冲区（长度为 3）。
#[allow(clippy::too_many_arguments)]
pub fn draw_rectangle<P: Copy>(
  image: &mut [P],
  height: usize,
  width: usize,
  x1: i32,
  y1: i32,
  x2: i32,
  y2: i32,
  color: &[P],
) {
  if height == 0 || width == 0 || color.is_empty() {
    return;
  }
  let clamp_x = |v: i32| v.clamp(0, width as i32 - 1) as usize;
  let clamp_y = |v: i32| v.clamp(0, height as i32 - 1) as usize;
  let (x1, x2) = (clamp_x(x1.min(x2)), clamp_x(x1.max(x2)));
  let (y1, y2) = (clamp_y(y1.min(y2)), clamp_y(y1.max(y2)));
  let stride = color.len();

  let mut put = |y: usize, x: usize| {
    let base = (y * width + x) * stride;
    if let Some(pixel) = image.get_mut(base..base + stride) {
      pixel.copy_from_slice(color);
    }
  };
  for x in x1..=x2 {
    put(y1, x);
    put(y2, x);
  }
  for y in y1..=y2 {
    put(y, x1);
    put(y, x2);
  }
}

/// 以 `(x, y)` 为中心画边长为 `size` 的实心方块
pub fn draw_point<P: Copy>(
  image: &mut [P],
  height: usize,
  width: usize,
  x: i32,
  y: i32,
  color: &[P],
  size: usize,
) {
  let half = (size / 2) as i32;
  let stride = color.len();
  for py in (y - half)..=(y + half) {
    if py < 0 || py >= height as i32 {
      continue;
    }
    for px in (x - half)..=(x + half) {
      if px < 0 || px >= width as i32 {
        continue;
      }
      let base = (py as usize * width + px as usize) * stride;
      if let Some(pixel) = image.get_mut(base..base + stride) {
        pixel.copy_from_slice(color);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rectangle_outline_is_clipped() {
    let mut image = vec![0u16; 5 * 5];
    draw_rectangle(&mut image, 5, 5, 1, 1, 10, 3, &[0xFFFF]);
    let row = |y: usize| image[y * 5..(y + 1) * 5].to_vec();
    assert_eq!(row(0), vec![0; 5]);
    assert_eq!(row(1), vec![0, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF]);
    assert_eq!(row(2), vec![0, 0xFFFF, 0, 0, 0xFFFF]);
    assert_eq!(row(3), vec![0, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF]);
    assert_eq!(row(4), vec![0; 5]);
  }

  #[test]
  fn point_on_rgb_buffer() {
    let mut image = vec![0u8; 3 * 3 * 3];
    draw_point(&mut image, 3, 3, 0, 0, &[255, 0, 0], 3);
    assert_eq!(&image[0..3], &[255, 0, 0]);
    assert_eq!(&image[3..6], &[255, 0, 0]);
    assert_eq!(&image[12..15], &[255, 0, 0]);
    assert_eq!(&image[6..9], &[0, 0, 0]);
  }
}
