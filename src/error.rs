// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 推理运行时错误定义
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

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DlError {
  #[error("内存申请失败: {bytes} 字节 (对齐 {align})")]
  AllocFailed { bytes: usize, align: usize },
  #[error("形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("指数不匹配: 期望 {expected}, 实际 {actual}")]
  ExponentMismatch { expected: i32, actual: i32 },
  #[error("张量已分配内存，形状不可修改: 当前 {current:?}, 请求 {requested:?}")]
  ShapeLocked {
    current: [usize; 3],
    requested: [usize; 3],
  },
  #[error("张量填充不足: 需要 {required:?}, 实际 {available:?}")]
  PaddingTooSmall {
    required: [usize; 4],
    available: [usize; 4],
  },
  #[error("张量尚未分配内存")]
  NotAllocated,
  #[error("非拥有视图不可重新分配内存")]
  ViewLocked,
  #[error("输入与输出共享同一块内存，无法同时借用")]
  BorrowConflict,
  #[error("索引越界: {index:?}, 范围 {bound:?}")]
  IndexOutOfRange { index: Vec<usize>, bound: Vec<usize> },
  #[error("无效的 stage 索引: {index}, 共 {count} 个 stage")]
  InvalidStage { index: usize, count: usize },
  #[error("无效参数: {0}")]
  InvalidArgument(String),
}

impl DlError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    DlError::InvalidArgument(msg.into())
  }

  pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
    DlError::ShapeMismatch {
      expected: expected.to_vec(),
      actual: actual.to_vec(),
    }
  }
}

pub type Result<T> = std::result::Result<T, DlError>;
