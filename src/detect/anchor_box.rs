// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detect/anchor_box.rs - 基于锚框的解码
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

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{StageParser, sigmoid};
use crate::{
  error::{DlError, Result},
  typedef::{Element, Tensor},
};

/// 一个输出层级的锚框配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorBoxStage {
  pub stride_y: usize,
  pub stride_x: usize,
  pub offset_y: usize,
  pub offset_x: usize,
  /// 缩放后输入的短边小于该值时跳过此 stage
  #[serde(default)]
  pub min_input_size: usize,
  /// 每个锚框的 `[height, width]`
  pub anchor_shape: Vec<[usize; 2]>,
}

/// 框回归的参考点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressType {
  /// 以网格点为锚框中心
  #[default]
  Center,
  /// 以网格点为锚框左上角
  LeftUp,
}

/// 分数通道的含义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
  /// 每个类别一个独立的 logit
  #[default]
  Sigmoid,
  /// 第 0 个通道是背景，其余为各类别，整体做 softmax
  Softmax,
}

impl ScoreType {
  fn background(&self) -> usize {
    match self {
      ScoreType::Sigmoid => 0,
      ScoreType::Softmax => 1,
    }
  }

  /// 返回最佳前景类别及其概率
  fn best(&self, logits: &[f32]) -> (usize, f32) {
    match self {
      ScoreType::Sigmoid => {
        let (category, logit) = argmax(logits);
        (category, sigmoid(logit))
      }
      ScoreType::Softmax => {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
        let (category, logit) = argmax(&logits[1..]);
        (category, (logit - max).exp() / sum)
      }
    }
  }
}

fn argmax(values: &[f32]) -> (usize, f32) {
  values
    .iter()
    .copied()
    .enumerate()
    .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
      if v > best.1 { (i, v) } else { best }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorBoxDecoder {
  pub stages: Vec<AnchorBoxStage>,
  #[serde(default)]
  pub regress_type: RegressType,
  #[serde(default)]
  pub score_type: ScoreType,
}

impl AnchorBoxDecoder {
  pub fn new(stages: Vec<AnchorBoxStage>) -> Self {
    Self {
      stages,
      regress_type: RegressType::default(),
      score_type: ScoreType::default(),
    }
  }

  pub fn regress_type(mut self, regress_type: RegressType) -> Self {
    self.regress_type = regress_type;
    self
  }

  pub fn score_type(mut self, score_type: ScoreType) -> Self {
    self.score_type = score_type;
    self
  }

  pub(super) fn validate(&self) -> Result<()> {
    for (index, stage) in self.stages.iter().enumerate() {
      if stage.stride_y == 0 || stage.stride_x == 0 {
        return Err(DlError::invalid(format!("stage {} 的步长不能为 0", index)));
      }
      if stage.anchor_shape.is_empty() {
        return Err(DlError::invalid(format!("stage {} 没有锚框", index)));
      }
    }
    Ok(())
  }

  pub(super) fn parse<O: Element>(
    &self,
    parser: &mut StageParser<'_>,
    score: &Tensor<O>,
    boxes: &Tensor<O>,
    keypoint: Option<&Tensor<O>>,
    stage_index: usize,
  ) -> Result<()> {
    let stage = &self.stages[stage_index];
    if parser.geometry().min_side() < stage.min_input_size {
      trace!(
        "stage {}: 输入短边 {} 小于 {}，跳过",
        stage_index,
        parser.geometry().min_side(),
        stage.min_input_size
      );
      return Ok(());
    }

    let anchor_number = stage.anchor_shape.len();
    let [height, width, score_channel] = *score.shape();
    let background = self.score_type.background();
    if score_channel % anchor_number != 0 || score_channel / anchor_number <= background {
      return Err(DlError::invalid(format!(
        "stage {}: 分数通道数 {} 与锚框数 {} 不匹配",
        stage_index, score_channel, anchor_number
      )));
    }
    let per_anchor = score_channel / anchor_number;
    if boxes.shape() != &[height, width, anchor_number * 4] {
      return Err(DlError::shape(&[height, width, anchor_number * 4], boxes.shape()));
    }
    let point_channel = match keypoint {
      Some(keypoint) => {
        let channel = keypoint.shape()[2];
        if keypoint.shape()[..2] != [height, width] || channel % (anchor_number * 2) != 0 {
          return Err(DlError::invalid(format!(
            "stage {}: 关键点形状 {:?} 与锚框数 {} 不匹配",
            stage_index,
            keypoint.shape(),
            anchor_number
          )));
        }
        channel / anchor_number
      }
      None => 0,
    };

    let score_scale = 2f32.powi(score.exponent());
    let box_scale = 2f32.powi(boxes.exponent());
    let point_scale = keypoint.map_or(1.0, |k| 2f32.powi(k.exponent()));
    let score_element = score.element()?;
    let box_element = boxes.element()?;
    let point_element = keypoint.map(|k| k.element()).transpose()?;
    let threshold = parser.score_threshold();

    let mut logits = vec![0f32; per_anchor];
    let mut points = vec![0f32; point_channel];
    for y in 0..height {
      let grid_y = (y * stage.stride_y + stage.offset_y) as f32;
      for x in 0..width {
        let grid_x = (x * stage.stride_x + stage.offset_x) as f32;
        for (a, &[anchor_height, anchor_width]) in stage.anchor_shape.iter().enumerate() {
          let base = score.offset_of(y, x, a * per_anchor);
          for (l, v) in logits.iter_mut().zip(&score_element[base..base + per_anchor]) {
            *l = v.to_i64() as f32 * score_scale;
          }
          let (category, probability) = self.score_type.best(&logits);
          if probability <= threshold {
            continue;
          }

          let (anchor_height, anchor_width) = (anchor_height as f32, anchor_width as f32);
          let base = boxes.offset_of(y, x, a * 4);
          let t: Vec<f32> = box_element[base..base + 4]
            .iter()
            .map(|v| v.to_i64() as f32 * box_scale)
            .collect();
          // CENTER：四个偏移都相对锚框中心；LEFT_UP：相对左上角，右下角再加上锚框尺寸
          let bbox = match self.regress_type {
            RegressType::Center => [
              grid_x + t[0] * anchor_width,
              grid_y + t[1] * anchor_height,
              grid_x + t[2] * anchor_width,
              grid_y + t[3] * anchor_height,
            ],
            RegressType::LeftUp => [
              grid_x + t[0] * anchor_width,
              grid_y + t[1] * anchor_height,
              grid_x + anchor_width + t[2] * anchor_width,
              grid_y + anchor_height + t[3] * anchor_height,
            ],
          };

          if let (Some(keypoint), Some(element)) = (keypoint, point_element.as_ref()) {
            let base = keypoint.offset_of(y, x, a * point_channel);
            for (i, (p, v)) in points
              .iter_mut()
              .zip(&element[base..base + point_channel])
              .enumerate()
            {
              let offset = v.to_i64() as f32 * point_scale;
              *p = if i % 2 == 0 {
                grid_x + offset * anchor_width
              } else {
                grid_y + offset * anchor_height
              };
            }
          }
          parser.push(category, probability, bbox, &points);
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detect::{Decoder, DetectItem, StageGeometry};

  fn geometry(size: usize) -> StageGeometry {
    StageGeometry {
      resized_height: size,
      resized_width: size,
      resize_scale_y: 1.0,
      resize_scale_x: 1.0,
      left_up_y: 0,
      left_up_x: 0,
    }
  }

  fn stage(min_input_size: usize) -> AnchorBoxStage {
    AnchorBoxStage {
      stride_y: 8,
      stride_x: 8,
      offset_y: 4,
      offset_x: 4,
      min_input_size,
      anchor_shape: vec![[16, 16]],
    }
  }

  fn parse(
    decoder: AnchorBoxDecoder,
    size: usize,
    score: &Tensor<i8>,
    boxes: &Tensor<i8>,
    keypoint: Option<&Tensor<i8>>,
  ) -> Result<Vec<DetectItem>> {
    let decoder = Decoder::AnchorBox(decoder);
    let mut box_list = Vec::new();
    let mut parser = StageParser::new(&decoder, geometry(size), 0.5, keypoint.is_some(), &mut box_list);
    match keypoint {
      Some(keypoint) => parser.parse_stage_with_keypoint(score, boxes, keypoint, 0)?,
      None => parser.parse_stage(score, boxes, 0)?,
    }
    Ok(box_list)
  }

  #[test]
  fn center_regression_decodes_single_cell() {
    // 2x2 网格，只有 (1, 0) 的分数为正
    let score = Tensor::from_element([2, 2, 1], 0, &[-4, -4, 3, -4]).unwrap();
    // 偏移 (-0.5, -0.5, 0.5, 0.25)，单位 2^-3
    let mut box_element = vec![0i8; 16];
    box_element[8..12].copy_from_slice(&[-4, -4, 4, 2]);
    let boxes = Tensor::from_element([2, 2, 4], -3, &box_element).unwrap();

    let items = parse(AnchorBoxDecoder::new(vec![stage(0)]), 16, &score, &boxes, None).unwrap();
    assert_eq!(items.len(), 1);
    // 锚框中心 (x, y) = (4, 12)，四条边都从中心按锚框尺寸偏移
    assert_eq!(items[0].bbox, [-4, 4, 12, 16]);
    assert_eq!(items[0].category, 0);
    assert!((items[0].score - sigmoid(3.0)).abs() < 1e-6);
  }

  #[test]
  fn center_regression_offsets_right_bottom_from_center() {
    let score = Tensor::from_element([1, 1, 1], 0, &[3]).unwrap();
    let boxes = Tensor::from_element([1, 1, 4], -1, &[1, 0, -1, 0]).unwrap();
    let items = parse(AnchorBoxDecoder::new(vec![stage(0)]), 16, &score, &boxes, None).unwrap();
    // 中心 (4, 4)：x1 = 4 + 0.5 × 16，x2 = 4 - 0.5 × 16
    assert_eq!(items[0].bbox, [12, 4, -4, 4]);

    // 同样的偏移在 LEFT_UP 下右下角还要加上锚框尺寸
    let decoder = AnchorBoxDecoder::new(vec![stage(0)]).regress_type(RegressType::LeftUp);
    let items = parse(decoder, 16, &score, &boxes, None).unwrap();
    assert_eq!(items[0].bbox, [12, 4, 12, 20]);
  }

  #[test]
  fn left_up_regression_with_keypoints() {
    let score = Tensor::from_element([1, 1, 1], 0, &[2]).unwrap();
    let boxes = Tensor::from_element([1, 1, 4], 0, &[0, 0, 0, 0]).unwrap();
    let keypoint = Tensor::from_element([1, 1, 2], -1, &[1, 2]).unwrap();
    let decoder = AnchorBoxDecoder::new(vec![stage(0)]).regress_type(RegressType::LeftUp);
    let items = parse(decoder, 16, &score, &boxes, Some(&keypoint)).unwrap();
    assert_eq!(items[0].bbox, [4, 4, 20, 20]);
    // (4 + 0.5 × 16, 4 + 1.0 × 16)
    assert_eq!(items[0].keypoint, vec![12, 20]);
  }

  #[test]
  fn softmax_skips_background() {
    // 背景 logit 最大，前景概率不足
    let score = Tensor::from_element([1, 1, 3], 0, &[5, 0, 1]).unwrap();
    let boxes = Tensor::from_element([1, 1, 4], 0, &[0; 4]).unwrap();
    let decoder = AnchorBoxDecoder::new(vec![stage(0)]).score_type(ScoreType::Softmax);
    assert!(parse(decoder.clone(), 16, &score, &boxes, None).unwrap().is_empty());

    let score = Tensor::from_element([1, 1, 3], 0, &[0, 1, 6]).unwrap();
    let items = parse(decoder, 16, &score, &boxes, None).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].category, 1);
  }

  #[test]
  fn small_input_skips_stage() {
    let score = Tensor::from_element([1, 1, 1], 0, &[5]).unwrap();
    let boxes = Tensor::from_element([1, 1, 4], 0, &[0; 4]).unwrap();
    let items = parse(AnchorBoxDecoder::new(vec![stage(32)]), 16, &score, &boxes, None).unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn rejects_box_channel_mismatch() {
    let score = Tensor::from_element([1, 1, 1], 0, &[5]).unwrap();
    let boxes = Tensor::from_element([1, 1, 2], 0, &[0; 2]).unwrap();
    assert!(parse(AnchorBoxDecoder::new(vec![stage(0)]), 16, &score, &boxes, None).is_err());
  }
}
