// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detect/anchor_point.rs - 基于锚点的解码
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPointStage {
  pub stride_y: usize,
  pub stride_x: usize,
  pub offset_y: usize,
  pub offset_x: usize,
  #[serde(default)]
  pub min_input_size: usize,
}

/// 每个网格点一个预测：分数为逐类别 sigmoid，框为到四条边的距离（以步长为单位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorPointDecoder {
  pub stages: Vec<AnchorPointStage>,
}

impl AnchorPointDecoder {
  pub fn new(stages: Vec<AnchorPointStage>) -> Self {
    Self { stages }
  }

  pub(super) fn validate(&self) -> Result<()> {
    match self
      .stages
      .iter()
      .position(|s| s.stride_y == 0 || s.stride_x == 0)
    {
      Some(index) => Err(DlError::invalid(format!("stage {} 的步长不能为 0", index))),
      None => Ok(()),
    }
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
      trace!("stage {}: 输入过小，跳过", stage_index);
      return Ok(());
    }

    let [height, width, category_number] = *score.shape();
    if category_number == 0 {
      return Err(DlError::invalid(format!("stage {}: 没有分数通道", stage_index)));
    }
    if boxes.shape() != &[height, width, 4] {
      return Err(DlError::shape(&[height, width, 4], boxes.shape()));
    }
    let point_channel = match keypoint {
      Some(keypoint) => {
        let channel = keypoint.shape()[2];
        if keypoint.shape()[..2] != [height, width] || channel % 2 != 0 {
          return Err(DlError::invalid(format!(
            "stage {}: 关键点形状 {:?} 不正确",
            stage_index,
            keypoint.shape()
          )));
        }
        channel
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
    let (stride_y, stride_x) = (stage.stride_y as f32, stage.stride_x as f32);

    let mut points = vec![0f32; point_channel];
    for y in 0..height {
      let grid_y = (y * stage.stride_y + stage.offset_y) as f32;
      for x in 0..width {
        let grid_x = (x * stage.stride_x + stage.offset_x) as f32;

        let base = score.offset_of(y, x, 0);
        let (category, logit) = score_element[base..base + category_number]
          .iter()
          .map(|v| v.to_i64())
          .enumerate()
          .fold((0, i64::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        let probability = sigmoid(logit as f32 * score_scale);
        if probability <= threshold {
          continue;
        }

        let base = boxes.offset_of(y, x, 0);
        let d = &box_element[base..base + 4];
        let distance = |i: usize| d[i].to_i64() as f32 * box_scale;
        let bbox = [
          grid_x - distance(0) * stride_x,
          grid_y - distance(1) * stride_y,
          grid_x + distance(2) * stride_x,
          grid_y + distance(3) * stride_y,
        ];

        if let (Some(keypoint), Some(element)) = (keypoint, point_element.as_ref()) {
          let base = keypoint.offset_of(y, x, 0);
          for (i, (p, v)) in points
            .iter_mut()
            .zip(&element[base..base + point_channel])
            .enumerate()
          {
            let offset = v.to_i64() as f32 * point_scale;
            *p = if i % 2 == 0 {
              grid_x + offset * stride_x
            } else {
              grid_y + offset * stride_y
            };
          }
        }
        parser.push(category, probability, bbox, &points);
      }
    }
    Ok(())
  }
}
