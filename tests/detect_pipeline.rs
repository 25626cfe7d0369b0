// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/detect_pipeline.rs - 检测流程集成测试
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

use shanan_dl::{
  Result, Tensor,
  detect::{
    AnchorPointDecoder, AnchorPointStage, Decoder, Detect, DetectItem, ResizeTarget, StageParser,
  },
  image::RawImage,
  model::{DetectModel, Infer},
};

/// 不论输入如何，都在缩放后输入的 (0, 0) 处输出一个 4x4 的框
struct RecordingModel {
  calls: usize,
  shapes: Vec<[usize; 3]>,
  left_ups: Vec<(i32, i32)>,
  score: Tensor<i16>,
  boxes: Tensor<i16>,
}

impl RecordingModel {
  fn new() -> Self {
    Self {
      calls: 0,
      shapes: Vec::new(),
      left_ups: Vec::new(),
      score: Tensor::from_element([1, 1, 1], 0, &[3]).unwrap(),
      boxes: Tensor::from_element([1, 1, 4], 0, &[0, 0, 1, 1]).unwrap(),
    }
  }
}

impl DetectModel for RecordingModel {
  type Input = i16;

  fn input_exponent(&self) -> i32 {
    0
  }

  fn call(&mut self, input: &mut Tensor<i16>, parser: &mut StageParser<'_>) -> Result<()> {
    self.calls += 1;
    self.shapes.push(*input.shape());
    let geometry = parser.geometry();
    self.left_ups.push((geometry.left_up_y, geometry.left_up_x));
    parser.parse_stage(&self.score, &self.boxes, 0)
  }
}

fn decoder() -> Decoder {
  Decoder::AnchorPoint(AnchorPointDecoder::new(vec![AnchorPointStage {
    stride_y: 4,
    stride_x: 4,
    offset_y: 0,
    offset_x: 0,
    min_input_size: 0,
  }]))
}

fn candidate(bbox: [i32; 4]) -> DetectItem {
  DetectItem {
    category: 0,
    score: 0.9,
    bbox,
    keypoint: Vec::new(),
  }
}

// =============================================================================
// 单次检测
// =============================================================================

#[test]
fn scale_half_resizes_and_maps_back() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .resize(ResizeTarget::Scale(0.5))
    .build()
    .unwrap();
  let pixels = vec![128u8; 64 * 64 * 3];
  let image = RawImage::new(&pixels, [64, 64, 3]).unwrap();

  let result = detect.infer(&image).unwrap().to_vec();
  assert_eq!(detect.resized_input().shape(), &[32, 32, 3]);
  assert_eq!(detect.resize_scale(), (2.0, 2.0));
  assert_eq!(detect.resized_input().get_element_value([5, 5, 1], false).unwrap(), 128);
  assert_eq!(result.len(), 1);
  assert_eq!(result[0].bbox, [0, 0, 8, 8]);
}

#[test]
fn shape_change_recomputes_resize_scale() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .resize(ResizeTarget::Scale(0.5))
    .build()
    .unwrap();
  let large = vec![0u8; 64 * 64 * 3];
  let small = vec![0u8; 32 * 48 * 3];
  detect.infer(&RawImage::new(&large, [64, 64, 3]).unwrap()).unwrap();
  detect.infer(&RawImage::new(&small, [32, 48, 3]).unwrap()).unwrap();
  detect.infer(&RawImage::new(&small, [32, 48, 3]).unwrap()).unwrap();
  assert_eq!(detect.model().shapes, vec![[32, 32, 3], [16, 24, 3], [16, 24, 3]]);
}

#[test]
fn fixed_size_target_with_gray_image() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .resize(ResizeTarget::Size { height: 8, width: 16 })
    .build()
    .unwrap();
  let pixels = vec![9u8; 16 * 64];
  let image = RawImage::new(&pixels, [16, 64, 1]).unwrap();
  let result = detect.infer(&image).unwrap().to_vec();
  assert_eq!(detect.resize_scale(), (2.0, 4.0));
  // 灰度输入复制到三个通道
  assert_eq!(detect.resized_input().get_element_value([0, 0, 2], false).unwrap(), 9);
  assert_eq!(result[0].bbox, [0, 0, 16, 8]);
}

#[test]
fn infer_trait_returns_owned_result() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder()).build().unwrap();
  let pixels = vec![0u8; 8 * 8 * 3];
  let image = RawImage::new(&pixels, [8, 8, 3]).unwrap();
  let result: Vec<DetectItem> = Infer::infer(&mut detect, &image).unwrap();
  assert_eq!(result.len(), 1);
}

#[test]
fn score_threshold_filters_everything() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .score_threshold(0.99)
    .build()
    .unwrap();
  let pixels = vec![0u8; 8 * 8 * 3];
  let image = RawImage::new(&pixels, [8, 8, 3]).unwrap();
  assert!(detect.infer(&image).unwrap().is_empty());
}

#[test]
fn builder_rejects_bad_configuration() {
  assert!(
    Detect::builder(RecordingModel::new(), decoder())
      .resize(ResizeTarget::Scale(0.0))
      .build()
      .is_err()
  );
  assert!(
    Detect::builder(RecordingModel::new(), Decoder::AnchorPoint(AnchorPointDecoder::new(vec![])))
      .build()
      .is_err()
  );
}

// =============================================================================
// 级联检测
// =============================================================================

#[test]
fn cascade_runs_model_once_per_candidate() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .resize(ResizeTarget::Size { height: 16, width: 16 })
    .nms_threshold(0.3)
    .build()
    .unwrap();
  let pixels = vec![0u8; 128 * 128 * 3];
  let image = RawImage::new(&pixels, [128, 128, 3]).unwrap();

  let candidates = [
    candidate([10, 10, 30, 20]),
    candidate([100, 100, 104, 104]),
    candidate([10, 10, 30, 20]),
  ];
  let result = detect.infer_with_candidates(&image, &candidates).unwrap().to_vec();

  assert_eq!(detect.model().calls, 3);
  // 中心 (15, 20)，边长 20
  assert_eq!(detect.model().left_ups, vec![(5, 10), (100, 100), (5, 10)]);
  // 第三个候选的结果与第一个重合，被抑制
  assert_eq!(
    result.iter().map(|item| item.bbox).collect::<Vec<_>>(),
    vec![[10, 5, 15, 10], [100, 100, 101, 101]]
  );
}

#[test]
fn cascade_with_scale_target_resizes_each_crop() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder())
    .resize(ResizeTarget::Scale(0.5))
    .build()
    .unwrap();
  let pixels = vec![0u8; 64 * 64 * 3];
  let image = RawImage::new(&pixels, [64, 64, 3]).unwrap();
  detect
    .infer_with_candidates(&image, &[candidate([0, 0, 40, 20]), candidate([0, 0, 8, 8])])
    .unwrap();
  assert_eq!(detect.model().shapes, vec![[20, 20, 3], [4, 4, 3]]);

  // 之后的整图检测重新使用整图的缩放
  detect.infer(&image).unwrap();
  assert_eq!(detect.model().shapes[2], [32, 32, 3]);
  assert_eq!(detect.left_up(), (0, 0));
}

#[test]
fn cascade_without_candidates_is_empty() {
  let mut detect = Detect::builder(RecordingModel::new(), decoder()).build().unwrap();
  let pixels = vec![0u8; 8 * 8 * 3];
  let image = RawImage::new(&pixels, [8, 8, 3]).unwrap();
  assert!(detect.infer_with_candidates(&image, &[]).unwrap().is_empty());
  assert_eq!(detect.model().calls, 0);
}
