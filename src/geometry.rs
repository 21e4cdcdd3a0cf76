// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框与回归量编解码
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

/// 边界框，角点形式 `(y1, x1, y2, x2)`
///
/// 整条流水线内使用归一化坐标，全零框是填充行的哨兵值。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
  pub y1: f32,
  pub x1: f32,
  pub y2: f32,
  pub x2: f32,
}

/// 相对参考框的回归量 `(dy, dx, dh, dw)`
///
/// 中心偏移以参考框高宽为单位，高宽在对数空间。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
  pub dy: f32,
  pub dx: f32,
  pub dh: f32,
  pub dw: f32,
}

impl BBox {
  /// 填充哨兵
  pub const ZERO: BBox = BBox::new(0.0, 0.0, 0.0, 0.0);
  /// 归一化图像窗口 `[0, 0, 1, 1]`
  pub const UNIT: BBox = BBox::new(0.0, 0.0, 1.0, 1.0);

  pub const fn new(y1: f32, x1: f32, y2: f32, x2: f32) -> Self {
    BBox { y1, x1, y2, x2 }
  }

  pub fn from_array(v: [f32; 4]) -> Self {
    BBox::new(v[0], v[1], v[2], v[3])
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.y1, self.x1, self.y2, self.x2]
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn center_y(&self) -> f32 {
    self.y1 + 0.5 * self.height()
  }

  pub fn center_x(&self) -> f32 {
    self.x1 + 0.5 * self.width()
  }

  /// 面积，倒置的框面积为 0
  pub fn area(&self) -> f32 {
    self.height().max(0.0) * self.width().max(0.0)
  }

  pub fn is_padding(&self) -> bool {
    self.y1 == 0.0 && self.x1 == 0.0 && self.y2 == 0.0 && self.x2 == 0.0
  }

  /// 交并比
  pub fn iou(&self, other: &BBox) -> f32 {
    let iy1 = self.y1.max(other.y1);
    let ix1 = self.x1.max(other.x1);
    let iy2 = self.y2.min(other.y2);
    let ix2 = self.x2.min(other.x2);
    let intersection = (iy2 - iy1).max(0.0) * (ix2 - ix1).max(0.0);
    let union = self.area() + other.area() - intersection;
    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  /// 将回归量作用于本框，返回修正后的框
  pub fn apply_delta(&self, delta: &Delta) -> BBox {
    let height = self.height();
    let width = self.width();
    let center_y = self.center_y() + delta.dy * height;
    let center_x = self.center_x() + delta.dx * width;
    let height = height * delta.dh.exp();
    let width = width * delta.dw.exp();

    let y1 = center_y - 0.5 * height;
    let x1 = center_x - 0.5 * width;
    BBox::new(y1, x1, y1 + height, x1 + width)
  }

  /// 计算从本框到 `target` 的回归量，是 [`BBox::apply_delta`] 的逆运算
  pub fn encode(&self, target: &BBox) -> Delta {
    let height = self.height();
    let width = self.width();
    Delta {
      dy: (target.center_y() - self.center_y()) / height,
      dx: (target.center_x() - self.center_x()) / width,
      dh: (target.height() / height).ln(),
      dw: (target.width() / width).ln(),
    }
  }

  /// 将每个坐标限制在窗口内
  pub fn clip(&self, window: &BBox) -> BBox {
    // 不用 f32::clamp，窗口退化或出现 NaN 时不能 panic
    let clamp = |v: f32, lo: f32, hi: f32| v.max(lo).min(hi);
    BBox::new(
      clamp(self.y1, window.y1, window.y2),
      clamp(self.x1, window.x1, window.x2),
      clamp(self.y2, window.y1, window.y2),
      clamp(self.x2, window.x1, window.x2),
    )
  }
}

impl From<[f32; 4]> for BBox {
  fn from(v: [f32; 4]) -> Self {
    BBox::from_array(v)
  }
}

impl Delta {
  pub const fn new(dy: f32, dx: f32, dh: f32, dw: f32) -> Self {
    Delta { dy, dx, dh, dw }
  }

  pub fn from_array(v: [f32; 4]) -> Self {
    Delta::new(v[0], v[1], v[2], v[3])
  }

  /// 按维度乘以标准差，还原训练时归一化过的回归量
  pub fn scale(&self, std_dev: &[f32; 4]) -> Delta {
    Delta::new(
      self.dy * std_dev[0],
      self.dx * std_dev[1],
      self.dh * std_dev[2],
      self.dw * std_dev[3],
    )
  }
}

impl From<[f32; 4]> for Delta {
  fn from(v: [f32; 4]) -> Self {
    Delta::from_array(v)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn close(a: &BBox, b: &BBox) -> bool {
    a.to_array()
      .iter()
      .zip(b.to_array())
      .all(|(x, y)| (x - y).abs() < 1e-5)
  }

  #[test]
  fn zero_delta_is_identity() {
    let b = BBox::new(0.1, 0.2, 0.5, 0.7);
    assert!(close(&b.apply_delta(&Delta::default()), &b));
  }

  #[test]
  fn apply_delta_shifts_and_scales() {
    let b = BBox::new(0.0, 0.0, 0.2, 0.4);
    let out = b.apply_delta(&Delta::new(0.5, -0.25, 2f32.ln(), 0.0));
    // 中心 (0.1, 0.2) -> (0.2, 0.1)，高 0.2 -> 0.4
    assert!(close(&out, &BBox::new(0.0, -0.1, 0.4, 0.3)));
  }

  #[test]
  fn encode_then_apply_round_trips() {
    let pairs = [
      (BBox::new(0.1, 0.1, 0.3, 0.4), BBox::new(0.15, 0.05, 0.5, 0.45)),
      (BBox::new(0.5, 0.5, 0.9, 0.6), BBox::new(0.45, 0.52, 0.7, 0.8)),
      (BBox::new(10.0, 20.0, 50.0, 30.0), BBox::new(0.0, 0.0, 64.0, 64.0)),
    ];
    for (a, b) in pairs {
      let delta = a.encode(&b);
      assert!(close(&a.apply_delta(&delta), &b), "{:?} -> {:?}", a, b);
    }
  }

  #[test]
  fn clip_clamps_into_window() {
    let b = BBox::new(-0.2, 0.5, 1.3, 0.9);
    assert_eq!(b.clip(&BBox::UNIT), BBox::new(0.0, 0.5, 1.0, 0.9));

    let window = BBox::new(0.25, 0.0, 0.75, 1.0);
    let clipped = BBox::new(0.0, 0.0, 0.1, 1.0).clip(&window);
    assert_eq!(clipped, BBox::new(0.25, 0.0, 0.25, 1.0));
    assert!(clipped.y1 <= clipped.y2 && clipped.x1 <= clipped.x2);
  }

  #[test]
  fn iou_basic_cases() {
    let a = BBox::new(0.0, 0.0, 1.0, 1.0);
    let b = BBox::new(0.0, 0.5, 1.0, 1.5);
    let c = BBox::new(2.0, 2.0, 3.0, 3.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    assert_eq!(a.iou(&c), 0.0);
    assert_eq!(BBox::ZERO.iou(&BBox::ZERO), 0.0);
  }

  #[test]
  fn padding_sentinel() {
    assert!(BBox::ZERO.is_padding());
    assert!(!BBox::new(0.0, 0.0, 0.0, 0.1).is_padding());
  }

  #[test]
  fn delta_scale_by_std_dev() {
    let d = Delta::new(1.0, 1.0, 1.0, 1.0).scale(&[0.1, 0.1, 0.2, 0.2]);
    assert_eq!(d, Delta::new(0.1, 0.1, 0.2, 0.2));
  }
}
