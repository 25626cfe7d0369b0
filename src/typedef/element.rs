// 该文件是 Shanan （山南西风） 项目的一部分。
// src/typedef/element.rs - 定点元素类型与量化规则
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

use std::fmt::Debug;

mod sealed {
  pub trait Sealed {}
  impl Sealed for i8 {}
  impl Sealed for i16 {}
}

/// 定点元素类型，实际值 = 存储整数 × 2^exponent
///
/// 目前只支持 `i8` 与 `i16` 两种特征图类型，累加统一在 `i64` 中完成。
pub trait Element: sealed::Sealed + Copy + Default + PartialEq + PartialOrd + Debug + 'static {
  const BITS: u32;
  const MIN: i64;
  const MAX: i64;

  fn to_i64(self) -> i64;

  /// 饱和截断到该类型的表示范围，而不是回绕
  fn saturate(value: i64) -> Self;

  /// 平均池化默认的倒数指数 `2 - bits`
  fn default_pool_exponent() -> i32 {
    2 - Self::BITS as i32
  }
}

impl Element for i8 {
  const BITS: u32 = 8;
  const MIN: i64 = i8::MIN as i64;
  const MAX: i64 = i8::MAX as i64;

  #[inline(always)]
  fn to_i64(self) -> i64 {
    self as i64
  }

  #[inline(always)]
  fn saturate(value: i64) -> Self {
    value.clamp(<Self as Element>::MIN, <Self as Element>::MAX) as i8
  }
}

impl Element for i16 {
  const BITS: u32 = 16;
  const MIN: i64 = i16::MIN as i64;
  const MAX: i64 = i16::MAX as i64;

  #[inline(always)]
  fn to_i64(self) -> i64 {
    self as i64
  }

  #[inline(always)]
  fn saturate(value: i64) -> Self {
    value.clamp(<Self as Element>::MIN, <Self as Element>::MAX) as i16
  }
}

/// `value × 2^shift`，右移时四舍五入（半数向上）
#[inline]
pub fn shift_round(value: i64, shift: i32) -> i64 {
  if shift >= 0 {
    let shift = shift.min(62) as u32;
    value.saturating_mul(1i64 << shift)
  } else {
    let n = (-shift).min(62) as u32;
    value.saturating_add(1i64 << (n - 1)) >> n
  }
}

/// 实数 `r` 量化为 `round(r / 2^exponent)`，超出范围时饱和
pub fn quantize<T: Element>(value: f32, exponent: i32) -> T {
  let scaled = (value as f64 / 2f64.powi(exponent)).round();
  T::saturate(scaled.clamp(i64::MIN as f64, i64::MAX as f64) as i64)
}

pub fn dequantize<T: Element>(value: T, exponent: i32) -> f32 {
  (value.to_i64() as f64 * 2f64.powi(exponent)) as f32
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn quantize_one_at_exponent_minus_seven() {
    assert_eq!(quantize::<i16>(1.0, -7), 128);
    // i8 放不下 128，饱和到 127
    assert_eq!(quantize::<i8>(1.0, -7), 127);
  }

  #[test]
  fn quantize_saturates_both_ends() {
    assert_eq!(quantize::<i8>(-1000.0, 0), -128);
    assert_eq!(quantize::<i16>(1.0e9, 0), i16::MAX);
  }

  #[test]
  fn saturate_clamps_to_element_range() {
    assert_eq!(i8::saturate(300), i8::MAX);
    assert_eq!(i8::saturate(-300), i8::MIN);
    assert_eq!(i8::saturate(-5), -5);
    assert_eq!(i16::saturate(i64::MAX), i16::MAX);
    assert_eq!(i16::saturate(-40_000), i16::MIN);
    assert_eq!(<i16 as Element>::MAX, 32_767);
  }

  #[test]
  fn dequantize_inverts_quantize() {
    let q = quantize::<i16>(0.75, -8);
    assert_eq!(q, 192);
    assert_eq!(dequantize(q, -8), 0.75);
  }

  #[test]
  fn shift_round_rounds_half_up() {
    assert_eq!(shift_round(5, -1), 3);
    assert_eq!(shift_round(-5, -1), -2);
    assert_eq!(shift_round(4, -2), 1);
    assert_eq!(shift_round(3, 2), 12);
    assert_eq!(shift_round(7, 0), 7);
  }
}
