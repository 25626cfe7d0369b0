// 该文件是 Shanan （山南西风） 项目的一部分。
// src/lib.rs - 库主文件
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

//! 面向嵌入式设备的定点推理运行时与基于锚框的目标检测解码器。
//!
//! - `typedef`: 带填充的量化张量与常量（卷积核、偏置、激活）
//! - `nn`: 形状推导与量化算子（conv2d、depthwise_conv2d、avg_pool2d、concat2d）
//! - `layer`: 两阶段（build / call）的层封装与模型前向约定
//! - `detect`: 单阶段与级联推理、框解码与非极大值抑制

pub mod detect;
pub mod error;
pub mod frame;
pub mod image;
pub mod input;
pub mod layer;
pub mod model;
pub mod nn;
pub mod output;
pub mod task;
pub mod tool;
pub mod typedef;

pub use error::{DlError, Result};
pub use typedef::{Activation, ActivationType, Bias, Constant, Element, Filter, Tensor};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> std::result::Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
