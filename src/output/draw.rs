// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use tracing::debug;

use crate::detect::DetectItem;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: i32 = 20;
const LABEL_CHAR_WIDTH: f32 = 9.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const KEYPOINT_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const TEXT_COLOR: [u8; 3] = [255, 255, 255]; // 白色
const KEYPOINT_RADIUS: i32 = 2;

pub struct Draw {
  font: FontArc,
  font_scale: PxScale,
  labels: Vec<String>,
  box_color: [u8; 3],
  keypoint_color: [u8; 3],
  keypoint_radius: i32,
}

impl Draw {
  /// 使用内置字体创建
  pub fn new() -> Result<Self, InvalidFont> {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font = FontArc::try_from_slice(font_data)?;

    Ok(Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      labels: Vec::new(),
      box_color: BOX_COLOR,
      keypoint_color: KEYPOINT_COLOR,
      keypoint_radius: KEYPOINT_RADIUS,
    })
  }

  /// 类别名称，下标即类别编号；没有名称的类别显示编号
  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn box_color(mut self, color: [u8; 3]) -> Self {
    self.box_color = color;
    self
  }

  pub fn keypoint_color(mut self, color: [u8; 3]) -> Self {
    self.keypoint_color = color;
    self
  }

  pub fn keypoint_radius(mut self, radius: i32) -> Self {
    self.keypoint_radius = radius;
    self
  }

  fn label_text(&self, item: &DetectItem) -> String {
    match self.labels.get(item.category) {
      Some(name) => format!("{} {:.2}", name, item.score),
      None => format!("{} {:.2}", item.category, item.score),
    }
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let [x1, y1, x2, y2] = item.bbox;
    let x_min = x1.min(x2).clamp(0, w - 1);
    let y_min = y1.min(y2).clamp(0, h - 1);
    let x_max = x1.max(x2).clamp(0, w - 1);
    let y_max = y1.max(y2).clamp(0, h - 1);

    // 坐标为闭区间，边框加粗为 2 像素
    let color = Rgb(self.box_color);
    let (width, height) = ((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32);
    draw_hollow_rect_mut(image, Rect::at(x_min, y_min).of_size(width, height), color);
    if width > 2 && height > 2 {
      let inner = Rect::at(x_min + 1, y_min + 1).of_size(width - 2, height - 2);
      draw_hollow_rect_mut(image, inner, color);
    }

    let label = self.label_text(item);
    let text_width = (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as i32;
    let label_y = (y_min - LABEL_TEXT_HEIGHT).max(0);
    let label_width = text_width.min(w - x_min);
    if label_width > 0 {
      let rect = Rect::at(x_min, label_y).of_size(label_width as u32, LABEL_TEXT_HEIGHT as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb(TEXT_COLOR),
        x_min,
        label_y + LABEL_TEXT_VERTICAL_PADDING,
        self.font_scale,
        &self.font,
        &label,
      );
    }
  }

  /// 在图像上绘制检测框、类别标签与关键点
  pub fn draw_detections_on_image(&self, image: &mut RgbImage, result: &[DetectItem]) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    for item in result {
      debug!(
        "类别 {} 分数 {:.3} 位置 {:?}",
        item.category, item.score, item.bbox
      );
      self.draw_bbox_with_label(image, item);
      for point in item.keypoint.chunks_exact(2) {
        draw_filled_circle_mut(
          image,
          (point[0], point[1]),
          self.keypoint_radius,
          Rgb(self.keypoint_color),
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item() -> DetectItem {
    DetectItem {
      category: 0,
      score: 0.9,
      bbox: [5, 24, 30, 38],
      keypoint: vec![15, 30],
    }
  }

  #[test]
  fn label_uses_name_or_category() {
    let draw = Draw::new().unwrap();
    assert_eq!(draw.label_text(&item()), "0 0.90");
    let draw = draw.labels(vec!["person".to_string()]);
    assert_eq!(draw.label_text(&item()), "person 0.90");
  }

  #[test]
  fn draws_box_label_and_keypoint() {
    let mut image = RgbImage::new(40, 40);
    let draw = Draw::new().unwrap().keypoint_radius(1).labels(vec!["person".to_string()]);
    draw.draw_detections_on_image(&mut image, &[item()]);

    // 边框
    assert_eq!(image.get_pixel(5, 24).0, BOX_COLOR);
    assert_eq!(image.get_pixel(30, 38).0, BOX_COLOR);
    assert_eq!(image.get_pixel(6, 30).0, BOX_COLOR);
    // 关键点
    assert_eq!(image.get_pixel(15, 30).0, KEYPOINT_COLOR);
    // 框内其余像素不变
    assert_eq!(image.get_pixel(25, 34).0, [0, 0, 0]);
    // 标签背景在框的上方，文字为白色
    assert_eq!(image.get_pixel(5, 4).0, BOX_COLOR);
    let has_text = (4..24)
      .flat_map(|y| (5..40).map(move |x| (x, y)))
      .any(|(x, y)| image.get_pixel(x, y).0[0] > 128);
    assert!(has_text);
  }

  #[test]
  fn box_outside_image_is_clamped() {
    let mut image = RgbImage::new(60, 60);
    let item = DetectItem {
      category: 3,
      score: 0.5,
      bbox: [-10, 30, 80, 80],
      keypoint: vec![-5, 100],
    };
    Draw::new().unwrap().draw_detections_on_image(&mut image, &[item]);
    assert_eq!(image.get_pixel(0, 59).0, BOX_COLOR);
    assert_eq!(image.get_pixel(59, 59).0, BOX_COLOR);
    assert_eq!(image.get_pixel(30, 45).0, [0, 0, 0]);
  }
}
