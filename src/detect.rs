// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detect.rs - 检测：缩放、逐 stage 解码与非极大值抑制
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

//! 检测流程
//!
//! `Detect` 持有缩放后的输入张量与候选框列表。每次推理：
//!
//! 1. 把原图（或候选框周围的正方形区域）裁剪缩放到输入张量；
//! 2. 清空候选框列表，调用模型，模型对每个 stage 调用 `StageParser::parse_stage`，
//!    解码出的候选框已经映射回原图坐标，并按分数降序插入列表；
//! 3. 对列表做一次非极大值抑制并返回。

mod anchor_box;
mod anchor_point;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
  error::{DlError, Result},
  image::{ImageSource, ResizeType, crop_and_resize},
  model::DetectModel,
  tool::Latency,
  typedef::{Element, Tensor},
};

pub use self::anchor_box::{AnchorBoxDecoder, AnchorBoxStage, RegressType, ScoreType};
pub use self::anchor_point::{AnchorPointDecoder, AnchorPointStage};

/// 一个检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  /// 类别索引
  pub category: usize,
  /// 置信度，由 `ScoreType` 决定如何从 logit 得到
  pub score: f32,
  /// 原图像素坐标 `[x1, y1, x2, y2]`
  pub bbox: [i32; 4],
  /// 原图像素坐标 `[x1, y1, x2, y2, ...]`，不带关键点时为空
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub keypoint: Vec<i32>,
}

/// 缩放后的输入大小
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeTarget {
  /// 按比例缩放，`round(dim * scale)`
  Scale(f32),
  /// 固定大小
  Size { height: usize, width: usize },
}

/// 解码方式，构造时选定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Decoder {
  AnchorBox(AnchorBoxDecoder),
  AnchorPoint(AnchorPointDecoder),
}

impl Decoder {
  pub fn stage_count(&self) -> usize {
    match self {
      Decoder::AnchorBox(decoder) => decoder.stages.len(),
      Decoder::AnchorPoint(decoder) => decoder.stages.len(),
    }
  }

  fn validate(&self) -> Result<()> {
    if self.stage_count() == 0 {
      return Err(DlError::invalid("解码器至少需要一个 stage"));
    }
    match self {
      Decoder::AnchorBox(decoder) => decoder.validate(),
      Decoder::AnchorPoint(decoder) => decoder.validate(),
    }
  }
}

/// 当前这次调用模型时，缩放后的输入与原图之间的几何关系
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageGeometry {
  pub resized_height: usize,
  pub resized_width: usize,
  pub resize_scale_y: f32,
  pub resize_scale_x: f32,
  pub left_up_y: i32,
  pub left_up_x: i32,
}

impl StageGeometry {
  pub fn min_side(&self) -> usize {
    self.resized_height.min(self.resized_width)
  }

  /// 缩放后输入上的横坐标映射回原图
  #[inline]
  pub fn map_x(&self, x: f32) -> i32 {
    (x * self.resize_scale_x).round() as i32 + self.left_up_x
  }

  #[inline]
  pub fn map_y(&self, y: f32) -> i32 {
    (y * self.resize_scale_y).round() as i32 + self.left_up_y
  }

  fn map_box(&self, bbox: [f32; 4]) -> [i32; 4] {
    [
      self.map_x(bbox[0]),
      self.map_y(bbox[1]),
      self.map_x(bbox[2]),
      self.map_y(bbox[3]),
    ]
  }

  fn map_points(&self, points: &[f32]) -> Vec<i32> {
    points
      .chunks_exact(2)
      .flat_map(|p| [self.map_x(p[0]), self.map_y(p[1])])
      .collect()
  }
}

/// 交给模型的逐 stage 解码器
pub struct StageParser<'a> {
  decoder: &'a Decoder,
  geometry: StageGeometry,
  score_threshold: f32,
  with_keypoint: bool,
  box_list: &'a mut Vec<DetectItem>,
}

impl<'a> StageParser<'a> {
  pub fn new(
    decoder: &'a Decoder,
    geometry: StageGeometry,
    score_threshold: f32,
    with_keypoint: bool,
    box_list: &'a mut Vec<DetectItem>,
  ) -> Self {
    Self {
      decoder,
      geometry,
      score_threshold,
      with_keypoint,
      box_list,
    }
  }

  pub fn geometry(&self) -> &StageGeometry {
    &self.geometry
  }

  pub fn score_threshold(&self) -> f32 {
    self.score_threshold
  }

  /// 模型是否应该输出关键点
  pub fn with_keypoint(&self) -> bool {
    self.with_keypoint
  }

  pub fn box_list(&self) -> &[DetectItem] {
    self.box_list
  }

  /// 解码一个 stage 的分数与框
  pub fn parse_stage<O: Element>(
    &mut self,
    score: &Tensor<O>,
    boxes: &Tensor<O>,
    stage_index: usize,
  ) -> Result<()> {
    self.parse(score, boxes, None, stage_index)
  }

  /// 解码一个 stage 的分数、框与关键点
  pub fn parse_stage_with_keypoint<O: Element>(
    &mut self,
    score: &Tensor<O>,
    boxes: &Tensor<O>,
    keypoint: &Tensor<O>,
    stage_index: usize,
  ) -> Result<()> {
    self.parse(score, boxes, Some(keypoint), stage_index)
  }

  fn parse<O: Element>(
    &mut self,
    score: &Tensor<O>,
    boxes: &Tensor<O>,
    keypoint: Option<&Tensor<O>>,
    stage_index: usize,
  ) -> Result<()> {
    let count = self.decoder.stage_count();
    if stage_index >= count {
      return Err(DlError::InvalidStage {
        index: stage_index,
        count,
      });
    }
    let before = self.box_list.len();
    let decoder = self.decoder;
    match decoder {
      Decoder::AnchorBox(decoder) => decoder.parse(self, score, boxes, keypoint, stage_index)?,
      Decoder::AnchorPoint(decoder) => decoder.parse(self, score, boxes, keypoint, stage_index)?,
    }
    trace!(
      "stage {}: 新增 {} 个候选框",
      stage_index,
      self.box_list.len() - before
    );
    Ok(())
  }

  /// 按分数降序插入：插在所有分数不低于它的候选框之后
  pub(crate) fn push(&mut self, category: usize, score: f32, bbox: [f32; 4], keypoint: &[f32]) {
    let item = DetectItem {
      category,
      score,
      bbox: self.geometry.map_box(bbox),
      keypoint: self.geometry.map_points(keypoint),
    };
    let position = self.box_list.partition_point(|other| other.score >= score);
    self.box_list.insert(position, item);
  }
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[inline]
fn area(bbox: &[i32; 4]) -> i64 {
  (bbox[2] - bbox[0] + 1) as i64 * (bbox[3] - bbox[1] + 1) as i64
}

/// 非极大值抑制
///
/// `box_list` 必须已经按分数降序排列，这里不再排序。按顺序扫描保留的框：
/// 保留数达到 `top_k` 时截断其后的全部框；否则删除之后与它 IoU 严格大于
/// `nms_threshold` 的框。面积按包含端点的像素计算，且不区分类别。
pub fn nms(box_list: &mut Vec<DetectItem>, nms_threshold: f32, top_k: usize) {
  if top_k == 0 {
    box_list.clear();
    return;
  }

  let len = box_list.len();
  let mut alive = vec![true; len];
  let mut end = len;
  let mut kept_number = 0;
  for kept in 0..len {
    if !alive[kept] {
      continue;
    }
    kept_number += 1;
    if kept_number >= top_k {
      end = kept + 1;
      break;
    }

    let kept_box = box_list[kept].bbox;
    let kept_area = area(&kept_box);
    for other in kept + 1..len {
      if !alive[other] {
        continue;
      }
      let other_box = box_list[other].bbox;
      let inter_height = kept_box[3].min(other_box[3]) - kept_box[1].max(other_box[1]) + 1;
      let inter_width = kept_box[2].min(other_box[2]) - kept_box[0].max(other_box[0]) + 1;
      if inter_height > 0 && inter_width > 0 {
        let inter_area = inter_height as i64 * inter_width as i64;
        let iou = inter_area as f32 / (kept_area + area(&other_box) - inter_area) as f32;
        if iou > nms_threshold {
          alive[other] = false;
        }
      }
    }
  }

  let mut index = 0;
  box_list.retain(|_| {
    let keep = index < end && alive[index];
    index += 1;
    keep
  });
}

/// 检测器
pub struct Detect<M: DetectModel> {
  model: M,
  decoder: Decoder,
  score_threshold: f32,
  nms_threshold: f32,
  top_k: usize,
  with_keypoint: bool,
  resize: ResizeTarget,
  resize_type: ResizeType,
  input_channel: usize,
  input_shape: [usize; 3],
  resize_scale_y: f32,
  resize_scale_x: f32,
  left_up_y: i32,
  left_up_x: i32,
  resized_input: Tensor<M::Input>,
  box_list: Vec<DetectItem>,
}

pub struct DetectBuilder<M: DetectModel> {
  model: M,
  decoder: Decoder,
  score_threshold: f32,
  nms_threshold: f32,
  top_k: usize,
  with_keypoint: bool,
  resize: ResizeTarget,
  resize_type: ResizeType,
  input_channel: usize,
}

impl<M: DetectModel> DetectBuilder<M> {
  pub fn score_threshold(mut self, score_threshold: f32) -> Self {
    self.score_threshold = score_threshold;
    self
  }

  pub fn nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn top_k(mut self, top_k: usize) -> Self {
    self.top_k = top_k;
    self
  }

  pub fn with_keypoint(mut self, with_keypoint: bool) -> Self {
    self.with_keypoint = with_keypoint;
    self
  }

  pub fn resize(mut self, resize: ResizeTarget) -> Self {
    self.resize = resize;
    self
  }

  pub fn resize_type(mut self, resize_type: ResizeType) -> Self {
    self.resize_type = resize_type;
    self
  }

  /// 模型输入的通道数，原图通道数不同时在缩放时转换
  pub fn input_channel(mut self, input_channel: usize) -> Self {
    self.input_channel = input_channel;
    self
  }

  pub fn build(self) -> Result<Detect<M>> {
    self.decoder.validate()?;
    if self.input_channel != 1 && self.input_channel != 3 {
      return Err(DlError::invalid(format!(
        "模型输入只支持 1 或 3 通道: {}",
        self.input_channel
      )));
    }

    let mut resized_input = Tensor::new();
    resized_input.set_exponent(self.model.input_exponent());
    match self.resize {
      ResizeTarget::Scale(scale) => {
        if !(scale > 0.0) || !scale.is_finite() {
          return Err(DlError::invalid(format!("缩放比例必须为正数: {}", scale)));
        }
      }
      ResizeTarget::Size { height, width } => {
        if height == 0 || width == 0 {
          return Err(DlError::invalid(format!(
            "缩放后的大小不能为 0: {}x{}",
            height, width
          )));
        }
        resized_input.set_shape([height, width, self.input_channel])?;
      }
    }

    debug!(
      "创建检测器: score_threshold = {}, nms_threshold = {}, top_k = {}, resize = {:?}",
      self.score_threshold, self.nms_threshold, self.top_k, self.resize
    );
    Ok(Detect {
      model: self.model,
      decoder: self.decoder,
      score_threshold: self.score_threshold,
      nms_threshold: self.nms_threshold,
      top_k: self.top_k,
      with_keypoint: self.with_keypoint,
      resize: self.resize,
      resize_type: self.resize_type,
      input_channel: self.input_channel,
      input_shape: [0; 3],
      resize_scale_y: 1.0,
      resize_scale_x: 1.0,
      left_up_y: 0,
      left_up_x: 0,
      resized_input,
      box_list: Vec::new(),
    })
  }
}

impl<M: DetectModel> Detect<M> {
  /// 默认 score_threshold = 0.5、nms_threshold = 0.3、top_k = 10、不缩放
  pub fn builder(model: M, decoder: Decoder) -> DetectBuilder<M> {
    DetectBuilder {
      model,
      decoder,
      score_threshold: 0.5,
      nms_threshold: 0.3,
      top_k: 10,
      with_keypoint: false,
      resize: ResizeTarget::Scale(1.0),
      resize_type: ResizeType::Nearest,
      input_channel: 3,
    }
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn model_mut(&mut self) -> &mut M {
    &mut self.model
  }

  pub fn decoder(&self) -> &Decoder {
    &self.decoder
  }

  pub fn set_score_threshold(&mut self, score_threshold: f32) -> &mut Self {
    self.score_threshold = score_threshold;
    self
  }

  pub fn set_nms_threshold(&mut self, nms_threshold: f32) -> &mut Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn set_top_k(&mut self, top_k: usize) -> &mut Self {
    self.top_k = top_k;
    self
  }

  pub fn resized_input(&self) -> &Tensor<M::Input> {
    &self.resized_input
  }

  pub fn box_list(&self) -> &[DetectItem] {
    &self.box_list
  }

  /// 当前的缩放比例 `(y, x)`
  pub fn resize_scale(&self) -> (f32, f32) {
    (self.resize_scale_y, self.resize_scale_x)
  }

  /// 当前裁剪区域的左上角 `(y, x)`
  pub fn left_up(&self) -> (i32, i32) {
    (self.left_up_y, self.left_up_x)
  }

  fn reshape_resized_input(&mut self, height: usize, width: usize) -> Result<()> {
    let shape = [height.max(1), width.max(1), self.input_channel];
    if self.resized_input.shape() != &shape {
      self.resized_input.free_element();
      self.resized_input.set_shape(shape)?;
    }
    Ok(())
  }

  /// 把原图上 `[src_y) x [src_x)` 的区域缩放到输入张量的内部区域
  fn resize_into_input<S: ImageSource + ?Sized>(
    &mut self,
    image: &S,
    src_y: std::ops::Range<i64>,
    src_x: std::ops::Range<i64>,
  ) -> Result<()> {
    self.resized_input.calloc_element()?;
    let [height, width, channel] = *self.resized_input.shape();
    let [top, _, left, _] = *self.resized_input.padding();
    let dst_width = self.resized_input.shape_with_padding()[1];
    let shift_left = -self.resized_input.exponent();
    let mut element = self.resized_input.element_mut()?;
    crop_and_resize(
      &mut element,
      dst_width,
      channel,
      top..top + height,
      left..left + width,
      image,
      src_y,
      src_x,
      self.resize_type,
      shift_left,
    )
  }

  fn call_model(&mut self) -> Result<()> {
    let [resized_height, resized_width, _] = *self.resized_input.shape();
    let geometry = StageGeometry {
      resized_height,
      resized_width,
      resize_scale_y: self.resize_scale_y,
      resize_scale_x: self.resize_scale_x,
      left_up_y: self.left_up_y,
      left_up_x: self.left_up_x,
    };
    let mut parser = StageParser::new(
      &self.decoder,
      geometry,
      self.score_threshold,
      self.with_keypoint,
      &mut self.box_list,
    );
    self.model.call(&mut self.resized_input, &mut parser)
  }

  /// 对整幅图像做一次检测
  pub fn infer<S: ImageSource + ?Sized>(&mut self, image: &S) -> Result<&[DetectItem]> {
    let mut latency = Latency::new();
    latency.start();
    let image_shape = image.shape();
    if image_shape[0] == 0 || image_shape[1] == 0 {
      return Err(DlError::invalid(format!("输入图像为空: {:?}", image_shape)));
    }

    if self.input_shape != image_shape {
      self.input_shape = image_shape;
      if let ResizeTarget::Scale(scale) = self.resize {
        let height = (image_shape[0] as f32 * scale).round() as usize;
        let width = (image_shape[1] as f32 * scale).round() as usize;
        self.reshape_resized_input(height, width)?;
      }
      let [resized_height, resized_width, _] = *self.resized_input.shape();
      self.resize_scale_y = image_shape[0] as f32 / resized_height as f32;
      self.resize_scale_x = image_shape[1] as f32 / resized_width as f32;
      debug!(
        "输入 {:?} 缩放为 {:?}",
        image_shape,
        self.resized_input.shape()
      );
    }
    self.left_up_y = 0;
    self.left_up_x = 0;
    self.resize_into_input(image, 0..image_shape[0] as i64, 0..image_shape[1] as i64)?;
    latency.end();
    latency.print("detect", "resize");

    latency.start();
    self.box_list.clear();
    self.call_model()?;
    latency.end();
    latency.print("detect", "call");

    latency.start();
    nms(&mut self.box_list, self.nms_threshold, self.top_k);
    latency.end();
    latency.print("detect", "nms");
    Ok(&self.box_list)
  }

  /// 以每个候选框为中心裁剪正方形区域分别检测，合并后做一次非极大值抑制
  pub fn infer_with_candidates<S: ImageSource + ?Sized>(
    &mut self,
    image: &S,
    candidates: &[DetectItem],
  ) -> Result<&[DetectItem]> {
    let image_shape = image.shape();
    if image_shape[0] == 0 || image_shape[1] == 0 {
      return Err(DlError::invalid(format!("输入图像为空: {:?}", image_shape)));
    }

    let mut latency = Latency::new();
    self.box_list.clear();
    for candidate in candidates {
      latency.start();
      let [x1, y1, x2, y2] = candidate.bbox;
      let center_x = (x1 + x2) >> 1;
      let center_y = (y1 + y2) >> 1;
      let side = (x2 - x1).max(y2 - y1).max(1);

      match self.resize {
        ResizeTarget::Scale(scale) => {
          let resized = (side as f32 * scale).round() as usize;
          self.reshape_resized_input(resized, resized)?;
        }
        ResizeTarget::Size { height, width } => self.reshape_resized_input(height, width)?,
      }
      let [resized_height, resized_width, _] = *self.resized_input.shape();
      self.resize_scale_y = side as f32 / resized_height as f32;
      self.resize_scale_x = side as f32 / resized_width as f32;
      self.left_up_y = center_y - side / 2;
      self.left_up_x = center_x - side / 2;

      let (top, left) = (self.left_up_y as i64, self.left_up_x as i64);
      self.resize_into_input(image, top..top + side as i64, left..left + side as i64)?;
      latency.end();
      latency.print("detect", "resize");

      latency.start();
      self.call_model()?;
      latency.end();
      latency.print("detect", "call");
    }
    // 下一次整图检测需要重新计算缩放比例
    self.input_shape = [0; 3];

    latency.start();
    nms(&mut self.box_list, self.nms_threshold, self.top_k);
    latency.end();
    latency.print("detect", "nms");
    Ok(&self.box_list)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(score: f32, bbox: [i32; 4], category: usize) -> DetectItem {
    DetectItem {
      category,
      score,
      bbox,
      keypoint: Vec::new(),
    }
  }

  #[test]
  fn nms_threshold_decides_suppression() {
    // 交集 6x6 = 36，面积各 121，IoU = 36 / 206 ≈ 0.175
    let boxes = vec![item(0.9, [0, 0, 10, 10], 0), item(0.8, [5, 5, 15, 15], 0)];

    let mut kept = boxes.clone();
    nms(&mut kept, 0.3, 10);
    assert_eq!(kept.len(), 2);

    let mut kept = boxes;
    nms(&mut kept, 0.1, 10);
    assert_eq!(kept, vec![item(0.9, [0, 0, 10, 10], 0)]);
  }

  #[test]
  fn nms_keeps_box_at_exact_threshold() {
    // 面积 100 与 50，交集 50，IoU 恰为 0.5
    let mut boxes = vec![item(0.9, [0, 0, 9, 9], 0), item(0.8, [0, 0, 9, 4], 0)];
    nms(&mut boxes, 0.5, 10);
    assert_eq!(boxes.len(), 2);
  }

  #[test]
  fn nms_ignores_category() {
    let mut boxes = vec![item(0.9, [0, 0, 10, 10], 0), item(0.8, [0, 0, 10, 10], 1)];
    nms(&mut boxes, 0.5, 10);
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].category, 0);
  }

  #[test]
  fn nms_truncates_to_top_k_prefix() {
    let boxes: Vec<DetectItem> = (0..6)
      .map(|i| item(1.0 - i as f32 * 0.1, [i * 100, 0, i * 100 + 10, 10], 0))
      .collect();
    for top_k in 0..8 {
      let mut kept = boxes.clone();
      nms(&mut kept, 0.5, top_k);
      assert!(kept.len() <= top_k);
      assert_eq!(kept[..], boxes[..kept.len()]);
    }
    let mut kept = boxes.clone();
    nms(&mut kept, 0.5, 3);
    assert_eq!(kept.len(), 3);
  }

  #[test]
  fn nms_counts_only_surviving_boxes_towards_top_k() {
    let mut boxes = vec![
      item(0.9, [0, 0, 10, 10], 0),
      item(0.8, [0, 0, 10, 10], 0),
      item(0.7, [50, 50, 60, 60], 0),
      item(0.6, [100, 100, 110, 110], 0),
    ];
    nms(&mut boxes, 0.5, 2);
    assert_eq!(
      boxes.iter().map(|b| b.score).collect::<Vec<_>>(),
      vec![0.9, 0.7]
    );
  }

  #[test]
  fn nms_on_empty_list() {
    let mut boxes = Vec::new();
    nms(&mut boxes, 0.5, 5);
    assert!(boxes.is_empty());
  }

  #[test]
  fn push_keeps_descending_order_and_is_stable() {
    let decoder = Decoder::AnchorPoint(AnchorPointDecoder {
      stages: vec![AnchorPointStage {
        stride_y: 8,
        stride_x: 8,
        offset_y: 0,
        offset_x: 0,
        min_input_size: 0,
      }],
    });
    let geometry = StageGeometry {
      resized_height: 32,
      resized_width: 32,
      resize_scale_y: 2.0,
      resize_scale_x: 2.0,
      left_up_y: 10,
      left_up_x: 20,
    };
    let mut box_list = Vec::new();
    let mut parser = StageParser::new(&decoder, geometry, 0.5, false, &mut box_list);
    parser.push(0, 0.6, [0.0, 0.0, 1.0, 1.0], &[]);
    parser.push(1, 0.9, [1.0, 1.0, 2.0, 2.0], &[]);
    parser.push(2, 0.6, [2.0, 2.0, 3.0, 3.0], &[]);
    parser.push(3, 0.7, [1.25, 0.0, 1.0, 1.0], &[0.5, 0.5]);

    let categories: Vec<usize> = parser.box_list().iter().map(|b| b.category).collect();
    assert_eq!(categories, vec![1, 3, 0, 2]);
    // round(1.25 * 2) + 20
    assert_eq!(parser.box_list()[1].bbox, [23, 10, 22, 12]);
    assert_eq!(parser.box_list()[1].keypoint, vec![21, 11]);
  }
}
