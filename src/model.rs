// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型接口
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
  detect::{Detect, DetectItem, StageParser},
  error::{DlError, Result},
  image::ImageSource,
  typedef::{Element, Tensor},
};

/// 被 `Detect` 驱动的模型
///
/// `call` 完成前向计算后，对每个输出 stage 调用一次 `parser.parse_stage`。
pub trait DetectModel {
  type Input: Element;

  /// 缩放后输入张量的指数
  fn input_exponent(&self) -> i32;

  fn call(&mut self, input: &mut Tensor<Self::Input>, parser: &mut StageParser<'_>) -> Result<()>;
}

/// 任务使用的推理接口
pub trait Infer<Frame> {
  type Output;
  type Error;

  fn infer(&mut self, input: &Frame) -> std::result::Result<Self::Output, Self::Error>;
}

impl<M: DetectModel, Frame: ImageSource> Infer<Frame> for Detect<M> {
  type Output = Vec<DetectItem>;
  type Error = DlError;

  fn infer(&mut self, input: &Frame) -> Result<Self::Output> {
    Detect::infer(self, input).map(<[DetectItem]>::to_vec)
  }
}

pub mod sequential;
pub use self::sequential::{JsonModel, JsonModelBuilder, JsonModelError, SequentialDetector};
