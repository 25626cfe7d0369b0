// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::Path;

use ab_glyph::InvalidFont;
use image::RgbImage;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  detect::DetectItem,
  frame::RgbNhwcFrame,
  output::{Render, draw::Draw},
};

pub struct SaveImageFileOutput {
  path: String,
  draw: Draw,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("帧大小与数据长度不一致: {0}x{1}")]
  FrameSizeError(usize, usize),
  #[error("无法加载内置字体: {0}")]
  FontLoadError(#[from] InvalidFont),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      draw: Draw::new()?,
    })
  }
}

impl SaveImageFileOutput {
  pub fn draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.draw = self.draw.labels(labels);
    self
  }

  fn save_image(&self, image: &RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;

    warn!("保存图像到文件: {}", self.path);

    Ok(())
  }
}

impl Render<RgbNhwcFrame, Vec<DetectItem>> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &RgbNhwcFrame, result: &Vec<DetectItem>) -> Result<(), Self::Error> {
    let (height, width) = (frame.height(), frame.width());
    let mut image = RgbImage::from_raw(width as u32, height as u32, frame.as_ref().to_vec())
      .ok_or(SaveImageFileError::FrameSizeError(height, width))?;
    self.draw.draw_detections_on_image(&mut image, result);
    self.save_image(&image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_detection_into_image_file() {
    let path = std::env::temp_dir().join("shanan_dl_save_image_file").join("result.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url)
      .unwrap()
      .labels(vec!["face".to_string()]);

    let frame = RgbNhwcFrame::with_shape(48, 64);
    let item = DetectItem {
      category: 0,
      score: 0.8,
      bbox: [10, 30, 40, 45],
      keypoint: Vec::new(),
    };
    output.render_result(&frame, &vec![item]).unwrap();

    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (64, 48));
    assert_eq!(saved.get_pixel(10, 30).0, [0, 255, 0]);
    assert_eq!(saved.get_pixel(50, 5).0, [0, 0, 0]);
  }

  #[test]
  fn rejects_other_scheme() {
    let url = Url::parse("json:///tmp/result.png").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
