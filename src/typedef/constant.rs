// 该文件是 Shanan （山南西风） 项目的一部分。
// src/typedef/constant.rs - 只读的量化常量：权重、偏置与激活
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

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
  error::{DlError, Result},
  typedef::Element,
};

/// 量化常量
///
/// 数据可以是编译进程序的 `&'static [T]`，也可以是运行时加载的 `Vec<T>`。
#[derive(Debug, Clone)]
pub struct Constant<T: Element> {
  element: Cow<'static, [T]>,
  exponent: i32,
  shape: Vec<usize>,
}

impl<T: Element> Constant<T> {
  pub fn new(
    element: impl Into<Cow<'static, [T]>>,
    exponent: i32,
    shape: Vec<usize>,
  ) -> Result<Self> {
    let element = element.into();
    let size: usize = shape.iter().product();
    if element.len() != size {
      return Err(DlError::shape(&[size], &[element.len()]));
    }
    Ok(Self {
      element,
      exponent,
      shape,
    })
  }

  pub fn element(&self) -> &[T] {
    &self.element
  }

  pub fn exponent(&self) -> i32 {
    self.exponent
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }
}

/// 卷积核，布局为 HWIO：`[filter_height, filter_width, input_channel, output_channel]`
#[derive(Debug, Clone)]
pub struct Filter<T: Element> {
  constant: Constant<T>,
  shape: [usize; 4],
  dilation: [usize; 2],
  shape_with_dilation: [usize; 4],
}

impl<T: Element> Filter<T> {
  pub fn new(element: impl Into<Cow<'static, [T]>>, exponent: i32, shape: [usize; 4]) -> Result<Self> {
    Self::with_dilation(element, exponent, shape, [1, 1])
  }

  pub fn with_dilation(
    element: impl Into<Cow<'static, [T]>>,
    exponent: i32,
    shape: [usize; 4],
    dilation: [usize; 2],
  ) -> Result<Self> {
    if shape.contains(&0) {
      return Err(DlError::invalid(format!("卷积核形状不能含 0: {:?}", shape)));
    }
    if dilation.contains(&0) {
      return Err(DlError::invalid(format!("膨胀系数不能为 0: {:?}", dilation)));
    }
    let constant = Constant::new(element, exponent, shape.to_vec())?;
    Ok(Self {
      constant,
      shape,
      dilation,
      shape_with_dilation: [
        (shape[0] - 1) * dilation[0] + 1,
        (shape[1] - 1) * dilation[1] + 1,
        shape[2],
        shape[3],
      ],
    })
  }

  pub fn element(&self) -> &[T] {
    self.constant.element()
  }

  pub fn exponent(&self) -> i32 {
    self.constant.exponent()
  }

  pub fn shape(&self) -> &[usize; 4] {
    &self.shape
  }

  pub fn dilation(&self) -> &[usize; 2] {
    &self.dilation
  }

  pub fn shape_with_dilation(&self) -> &[usize; 4] {
    &self.shape_with_dilation
  }

  #[inline(always)]
  pub fn value(&self, fy: usize, fx: usize, ic: usize, oc: usize) -> T {
    let [_, fw, in_c, out_c] = self.shape;
    self.constant.element[((fy * fw + fx) * in_c + ic) * out_c + oc]
  }

  /// 打印第 `n` 个输出通道的卷积核
  pub fn print2d_n(&self, n: usize, message: &str) -> Result<()> {
    let [fh, fw, in_c, out_c] = self.shape;
    if n >= out_c {
      return Err(DlError::IndexOutOfRange {
        index: vec![n],
        bound: vec![out_c],
      });
    }
    info!("{}[{}]: shape = {:?}, exponent = {}", message, n, self.shape, self.exponent());
    for ic in 0..in_c {
      info!("input_channel = {}", ic);
      for fy in 0..fh {
        let row: Vec<T> = (0..fw).map(|fx| self.value(fy, fx, ic, n)).collect();
        info!("{:?}", row);
      }
    }
    Ok(())
  }
}

/// 每个输出通道一个偏置
#[derive(Debug, Clone)]
pub struct Bias<T: Element> {
  constant: Constant<T>,
}

impl<T: Element> Bias<T> {
  pub fn new(element: impl Into<Cow<'static, [T]>>, exponent: i32) -> Result<Self> {
    let element = element.into();
    let len = element.len();
    Ok(Self {
      constant: Constant::new(element, exponent, vec![len])?,
    })
  }

  pub fn element(&self) -> &[T] {
    self.constant.element()
  }

  pub fn exponent(&self) -> i32 {
    self.constant.exponent()
  }

  pub fn len(&self) -> usize {
    self.constant.element().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
  Linear,
  #[serde(rename = "relu")]
  ReLU,
  #[serde(rename = "leaky_relu")]
  LeakyReLU,
  #[serde(rename = "prelu")]
  PReLU,
}

/// 激活函数
///
/// LeakyReLU 只有一个斜率，PReLU 每个通道一个斜率；斜率的实际值为 `element * 2^exponent`。
#[derive(Debug, Clone)]
pub struct Activation<T: Element> {
  activation_type: ActivationType,
  constant: Option<Constant<T>>,
}

impl<T: Element> Activation<T> {
  pub fn linear() -> Self {
    Self {
      activation_type: ActivationType::Linear,
      constant: None,
    }
  }

  pub fn relu() -> Self {
    Self {
      activation_type: ActivationType::ReLU,
      constant: None,
    }
  }

  pub fn leaky_relu(alpha: T, exponent: i32) -> Self {
    Self {
      activation_type: ActivationType::LeakyReLU,
      constant: Some(Constant {
        element: Cow::Owned(vec![alpha]),
        exponent,
        shape: vec![1],
      }),
    }
  }

  pub fn prelu(element: impl Into<Cow<'static, [T]>>, exponent: i32) -> Result<Self> {
    let element = element.into();
    if element.is_empty() {
      return Err(DlError::invalid("PReLU 至少需要一个斜率"));
    }
    let len = element.len();
    Ok(Self {
      activation_type: ActivationType::PReLU,
      constant: Some(Constant::new(element, exponent, vec![len])?),
    })
  }

  pub fn activation_type(&self) -> ActivationType {
    self.activation_type
  }

  /// 斜率的指数，Linear 与 ReLU 为 0
  pub fn exponent(&self) -> i32 {
    self.constant.as_ref().map(Constant::exponent).unwrap_or(0)
  }

  /// 斜率的个数，Linear 与 ReLU 为 0
  pub fn len(&self) -> usize {
    self.constant.as_ref().map(|c| c.element().len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 第 `channel` 个通道的斜率
  #[inline(always)]
  pub fn slope(&self, channel: usize) -> i64 {
    match (&self.activation_type, &self.constant) {
      (ActivationType::LeakyReLU, Some(c)) => c.element()[0].to_i64(),
      (ActivationType::PReLU, Some(c)) => c.element()[channel].to_i64(),
      _ => 0,
    }
  }
}
