// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/sequential.rs - 以 JSON 描述的顺序检测模型
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

//! 顺序检测模型
//!
//! 主干是一串依次相连的层，每个检测头挂在某一层的输出上，由分数、框与可选的关键点三个卷积组成，
//! 第 i 个检测头对应解码器的第 i 个 stage。
//!
//! 描述文件示例：
//!
//! ```json
//! {
//!   "labels": ["face"],
//!   "input_exponent": 0,
//!   "detect": { "score_threshold": 0.5, "resize": { "scale": 0.5 } },
//!   "decoder": { "type": "anchor_point", "stages": [{ "stride_y": 1, "stride_x": 1, "offset_y": 0, "offset_x": 0 }] },
//!   "backbone": [{ "type": "conv2d", "output_exponent": 0, "filter": { "element": [1], "exponent": 0, "shape": [1, 1, 1, 1] } }],
//!   "heads": [{ "source": 0, "score": { ... }, "box": { ... } }]
//! }
//! ```

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  detect::{Decoder, Detect, ResizeTarget, StageParser},
  error::{DlError, Result},
  image::ResizeType,
  layer::{AvgPool2D, Conv2D, DepthwiseConv2D, Layer, Model},
  model::DetectModel,
  nn::PaddingType,
  typedef::{Activation, ActivationType, Bias, Element, Filter, Tensor},
};

#[derive(Error, Debug)]
pub enum JsonModelError {
  #[error("模型文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型描述解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("模型构建错误: {0}")]
  Dl(#[from] DlError),
  #[error("模型路径错误: {0}")]
  Path(String),
  #[error("模型描述无效: {0}")]
  Invalid(String),
}

fn one_pair() -> [usize; 2] {
  [1, 1]
}

fn three() -> usize {
  3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantDescription {
  pub element: Vec<i64>,
  pub exponent: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDescription {
  pub element: Vec<i64>,
  pub exponent: i32,
  /// HWIO
  pub shape: [usize; 4],
  #[serde(default = "one_pair")]
  pub dilation: [usize; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationDescription {
  #[serde(rename = "type")]
  pub activation_type: ActivationType,
  #[serde(default)]
  pub element: Vec<i64>,
  #[serde(default)]
  pub exponent: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvDescription {
  #[serde(default)]
  pub name: Option<String>,
  pub output_exponent: i32,
  pub filter: FilterDescription,
  #[serde(default)]
  pub bias: Option<ConstantDescription>,
  #[serde(default)]
  pub activation: Option<ActivationDescription>,
  #[serde(default)]
  pub padding_type: PaddingType,
  /// `[stride_y, stride_x]`
  #[serde(default = "one_pair")]
  pub stride: [usize; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDescription {
  #[serde(default)]
  pub name: Option<String>,
  pub output_exponent: i32,
  pub filter_shape: [usize; 2],
  #[serde(default = "one_pair")]
  pub stride: [usize; 2],
  #[serde(default)]
  pub padding_type: PaddingType,
  #[serde(default)]
  pub pool_exponent: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum LayerDescription {
  Conv2d(ConvDescription),
  DepthwiseConv2d(ConvDescription),
  AvgPool2d(PoolDescription),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadDescription {
  /// 挂载的主干层下标
  pub source: usize,
  pub score: ConvDescription,
  #[serde(rename = "box")]
  pub boxes: ConvDescription,
  #[serde(default)]
  pub keypoint: Option<ConvDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectDescription {
  pub score_threshold: f32,
  pub nms_threshold: f32,
  pub top_k: usize,
  pub with_keypoint: bool,
  pub resize: ResizeTarget,
  pub resize_type: ResizeType,
}

impl Default for DetectDescription {
  fn default() -> Self {
    Self {
      score_threshold: 0.5,
      nms_threshold: 0.3,
      top_k: 10,
      with_keypoint: false,
      resize: ResizeTarget::Scale(1.0),
      resize_type: ResizeType::Nearest,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescription {
  #[serde(default)]
  pub labels: Vec<String>,
  #[serde(default)]
  pub input_exponent: i32,
  #[serde(default = "three")]
  pub input_channel: usize,
  #[serde(default)]
  pub detect: DetectDescription,
  pub decoder: Decoder,
  pub backbone: Vec<LayerDescription>,
  pub heads: Vec<HeadDescription>,
}

impl std::str::FromStr for ModelDescription {
  type Err = JsonModelError;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    Ok(serde_json::from_str(s)?)
  }
}

/// 把描述文件中的整数转换为元素类型，超出范围视为错误
fn to_element<T: Element>(values: &[i64], what: &str) -> std::result::Result<Vec<T>, JsonModelError> {
  values
    .iter()
    .map(|&v| {
      let element = T::saturate(v);
      if element.to_i64() == v {
        Ok(element)
      } else {
        Err(JsonModelError::Invalid(format!(
          "{}: {} 超出 {} 位整数范围",
          what,
          v,
          T::BITS
        )))
      }
    })
    .collect()
}

struct ConvParts<T: Element> {
  name: String,
  filter: Rc<Filter<T>>,
  bias: Option<Rc<Bias<T>>>,
  activation: Option<Rc<Activation<T>>>,
}

fn conv_parts<T: Element>(
  description: &ConvDescription,
  default_name: String,
) -> std::result::Result<ConvParts<T>, JsonModelError> {
  let name = description.name.clone().unwrap_or(default_name);
  let filter = &description.filter;
  let filter = Filter::with_dilation(
    to_element::<T>(&filter.element, &name)?,
    filter.exponent,
    filter.shape,
    filter.dilation,
  )?;
  let bias = description
    .bias
    .as_ref()
    .map(|b| -> std::result::Result<_, JsonModelError> {
      Ok(Rc::new(Bias::new(to_element::<T>(&b.element, &name)?, b.exponent)?))
    })
    .transpose()?;
  let activation = match &description.activation {
    None => None,
    Some(a) => Some(Rc::new(match a.activation_type {
      ActivationType::Linear => Activation::linear(),
      ActivationType::ReLU => Activation::relu(),
      ActivationType::LeakyReLU => {
        let alpha = to_element::<T>(&a.element, &name)?;
        match alpha.as_slice() {
          [alpha] => Activation::leaky_relu(*alpha, a.exponent),
          _ => {
            return Err(JsonModelError::Invalid(format!(
              "{}: LeakyReLU 需要且只需要一个斜率",
              name
            )));
          }
        }
      }
      ActivationType::PReLU => Activation::prelu(to_element::<T>(&a.element, &name)?, a.exponent)?,
    })),
  };
  Ok(ConvParts {
    name,
    filter: Rc::new(filter),
    bias,
    activation,
  })
}

fn build_conv<T: Element>(
  description: &ConvDescription,
  default_name: String,
) -> std::result::Result<Conv2D<T>, JsonModelError> {
  let parts = conv_parts(description, default_name)?;
  let mut layer = Conv2D::new(description.output_exponent, parts.filter)
    .named(&parts.name)
    .padding_type(description.padding_type)
    .stride(description.stride[0], description.stride[1]);
  if let Some(bias) = parts.bias {
    layer = layer.bias(bias);
  }
  if let Some(activation) = parts.activation {
    layer = layer.activation(activation);
  }
  Ok(layer)
}

fn build_depthwise_conv<T: Element>(
  description: &ConvDescription,
  default_name: String,
) -> std::result::Result<DepthwiseConv2D<T>, JsonModelError> {
  let parts = conv_parts(description, default_name)?;
  let mut layer = DepthwiseConv2D::new(description.output_exponent, parts.filter)
    .named(&parts.name)
    .padding_type(description.padding_type)
    .stride(description.stride[0], description.stride[1]);
  if let Some(bias) = parts.bias {
    layer = layer.bias(bias);
  }
  if let Some(activation) = parts.activation {
    layer = layer.activation(activation);
  }
  Ok(layer)
}

/// 一个检测头，输出对应一个解码 stage
#[derive(Debug)]
pub struct Head<T: Element> {
  source: usize,
  score: Conv2D<T>,
  boxes: Conv2D<T>,
  keypoint: Option<Conv2D<T>>,
}

impl<T: Element> Head<T> {
  pub fn new(source: usize, score: Conv2D<T>, boxes: Conv2D<T>) -> Self {
    Self {
      source,
      score,
      boxes,
      keypoint: None,
    }
  }

  pub fn keypoint(mut self, keypoint: Conv2D<T>) -> Self {
    self.keypoint = Some(keypoint);
    self
  }

  fn layers_mut(&mut self) -> impl Iterator<Item = &mut Conv2D<T>> {
    [&mut self.score, &mut self.boxes]
      .into_iter()
      .chain(self.keypoint.as_mut())
  }
}

/// 主干加检测头的顺序模型
pub struct SequentialDetector<T: Element> {
  input_exponent: i32,
  labels: Vec<String>,
  backbone: Vec<Box<dyn Layer<T>>>,
  heads: Vec<Head<T>>,
  built_shape: Option<[usize; 3]>,
}

impl<T: Element> SequentialDetector<T> {
  pub fn new(input_exponent: i32) -> Self {
    Self {
      input_exponent,
      labels: Vec::new(),
      backbone: Vec::new(),
      heads: Vec::new(),
      built_shape: None,
    }
  }

  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn push_layer(&mut self, layer: Box<dyn Layer<T>>) {
    self.backbone.push(layer);
    self.built_shape = None;
  }

  pub fn push_head(&mut self, head: Head<T>) -> Result<()> {
    if head.source >= self.backbone.len() {
      return Err(DlError::IndexOutOfRange {
        index: vec![head.source],
        bound: vec![self.backbone.len()],
      });
    }
    self.heads.push(head);
    self.built_shape = None;
    Ok(())
  }

  pub fn label(&self, category: usize) -> Option<&str> {
    self.labels.get(category).map(String::as_str)
  }

  pub fn label_names(&self) -> &[String] {
    &self.labels
  }

  pub fn backbone(&self) -> &[Box<dyn Layer<T>>] {
    &self.backbone
  }

  pub fn head_count(&self) -> usize {
    self.heads.len()
  }

  pub fn from_description(description: &ModelDescription) -> std::result::Result<Self, JsonModelError> {
    if description.backbone.is_empty() {
      return Err(JsonModelError::Invalid("主干至少需要一层".to_string()));
    }
    if description.heads.len() != description.decoder.stage_count() {
      return Err(JsonModelError::Invalid(format!(
        "检测头数量 {} 与 stage 数量 {} 不一致",
        description.heads.len(),
        description.decoder.stage_count()
      )));
    }

    let mut model = Self::new(description.input_exponent).labels(description.labels.clone());
    for (index, layer) in description.backbone.iter().enumerate() {
      let layer: Box<dyn Layer<T>> = match layer {
        LayerDescription::Conv2d(conv) => Box::new(build_conv::<T>(conv, format!("conv2d_{}", index))?),
        LayerDescription::DepthwiseConv2d(conv) => Box::new(build_depthwise_conv::<T>(
          conv,
          format!("depthwise_conv2d_{}", index),
        )?),
        LayerDescription::AvgPool2d(pool) => {
          let mut layer = AvgPool2D::new(pool.output_exponent, pool.filter_shape)
            .named(
              pool
                .name
                .as_deref()
                .unwrap_or(&format!("avg_pool2d_{}", index)),
            )
            .padding_type(pool.padding_type)
            .stride(pool.stride[0], pool.stride[1]);
          if let Some(pool_exponent) = pool.pool_exponent {
            layer = layer.pool_exponent(pool_exponent);
          }
          Box::new(layer)
        }
      };
      model.push_layer(layer);
    }

    for (index, head) in description.heads.iter().enumerate() {
      let mut built = Head::new(
        head.source,
        build_conv::<T>(&head.score, format!("head_{}_score", index))?,
        build_conv::<T>(&head.boxes, format!("head_{}_box", index))?,
      );
      if let Some(keypoint) = &head.keypoint {
        built = built.keypoint(build_conv::<T>(keypoint, format!("head_{}_keypoint", index))?);
      }
      model.push_head(built)?;
    }
    debug!(
      "顺序模型: 主干 {} 层, 检测头 {} 个",
      model.backbone.len(),
      model.heads.len()
    );
    Ok(model)
  }
}

impl<T: Element> Model<T> for SequentialDetector<T> {
  fn build(&mut self, input: &mut Tensor<T>) -> Result<()> {
    for index in 0..self.backbone.len() {
      let (done, rest) = self.backbone.split_at_mut(index);
      match done.last_mut() {
        Some(previous) => rest[0].build(previous.output_mut())?,
        None => rest[0].build(input)?,
      }
    }
    for head in &mut self.heads {
      let source = self.backbone[head.source].output_mut();
      for layer in head.layers_mut() {
        layer.build(source)?;
      }
    }
    Ok(())
  }

  fn call(&mut self, input: &Tensor<T>) -> Result<()> {
    for index in 0..self.backbone.len() {
      let (done, rest) = self.backbone.split_at_mut(index);
      let source = match done.last() {
        Some(previous) => previous.output(),
        None => input,
      };
      rest[0].call(source, true)?;
    }
    for head in &mut self.heads {
      let source = self.backbone[head.source].output();
      for layer in head.layers_mut() {
        layer.call(source, false)?;
      }
    }
    Ok(())
  }

  fn built_shape(&mut self) -> &mut Option<[usize; 3]> {
    &mut self.built_shape
  }
}

impl<T: Element> DetectModel for SequentialDetector<T> {
  type Input = T;

  fn input_exponent(&self) -> i32 {
    self.input_exponent
  }

  fn call(&mut self, input: &mut Tensor<T>, parser: &mut StageParser<'_>) -> Result<()> {
    self.forward(input)?;
    for (stage_index, head) in self.heads.iter().enumerate() {
      match (&head.keypoint, parser.with_keypoint()) {
        (Some(keypoint), true) => parser.parse_stage_with_keypoint(
          head.score.output(),
          head.boxes.output(),
          keypoint.output(),
          stage_index,
        )?,
        _ => parser.parse_stage(head.score.output(), head.boxes.output(), stage_index)?,
      }
    }
    Ok(())
  }
}

/// 由 JSON 描述构建的检测器
pub type JsonModel<T> = Detect<SequentialDetector<T>>;

pub struct JsonModelBuilder {
  model_path: String,
}

impl FromUrl for JsonModelBuilder {
  type Error = JsonModelError;

  fn from_url(url: &Url) -> std::result::Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonModelError::Path(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    Ok(Self {
      model_path: url.path().to_string(),
    })
  }
}

impl FromUrlWithScheme for JsonModelBuilder {
  const SCHEME: &'static str = "json";
}

impl JsonModelBuilder {
  pub fn build<T: Element>(self) -> std::result::Result<JsonModel<T>, JsonModelError> {
    info!("加载模型描述: {}", self.model_path);
    let text = std::fs::read_to_string(&self.model_path)?;
    let description: ModelDescription = text.parse()?;
    build_detect(description)
  }
}

/// 按描述构建模型，并用描述中的检测参数包装为检测器
pub fn build_detect<T: Element>(
  description: ModelDescription,
) -> std::result::Result<JsonModel<T>, JsonModelError> {
  let model = SequentialDetector::<T>::from_description(&description)?;
  let detect = description.detect;
  let detector = Detect::builder(model, description.decoder)
    .score_threshold(detect.score_threshold)
    .nms_threshold(detect.nms_threshold)
    .top_k(detect.top_k)
    .with_keypoint(detect.with_keypoint)
    .resize(detect.resize)
    .resize_type(detect.resize_type)
    .input_channel(description.input_channel)
    .build()?;
  info!("模型加载完成");
  Ok(detector)
}
