// 该文件是 Shanan （山南西风） 项目的一部分。
// src/anchor.rs - 特征金字塔锚框生成
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

use std::sync::Arc;

use ndarray::{ArrayView1, ArrayView2};
use thiserror::Error;
use tracing::{debug, error};

use crate::geometry::{BBox, Delta};

#[derive(Error, Debug)]
pub enum AnchorError {
  #[error("尺度数量 {scales} 与金字塔层数 {levels} 不一致")]
  LevelMismatch { scales: usize, levels: usize },
  #[error("锚框参数会产生零面积锚框: {0}")]
  ZeroArea(String),
  #[error("锚框数量 {anchors} 与网络输出不一致: 概率 {probs}, 回归量 {deltas:?}")]
  OutputMismatch {
    anchors: usize,
    probs: usize,
    deltas: Vec<usize>,
  },
}

/// 锚框生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorParams {
  /// 每层锚框边长（像素）
  pub scales: Vec<f32>,
  /// 所有层共用的宽高比
  pub ratios: Vec<f32>,
  /// 每层相对输入图像的下采样倍数
  pub strides: Vec<u32>,
  /// 特征图上每隔几个单元放置一次锚框
  pub anchor_stride: u32,
  pub image_height: u32,
  pub image_width: u32,
}

/// 锚框生成器
///
/// 输出顺序为 层 → 行 → 列 → 宽高比，必须与 RPN 头的扁平化输出顺序一致。
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
  params: AnchorParams,
}

impl AnchorGenerator {
  pub fn new(params: AnchorParams) -> Result<Self, AnchorError> {
    if params.scales.len() != params.strides.len() {
      error!(
        "尺度数量 {} 与金字塔层数 {} 不一致",
        params.scales.len(),
        params.strides.len()
      );
      return Err(AnchorError::LevelMismatch {
        scales: params.scales.len(),
        levels: params.strides.len(),
      });
    }

    let zero_area = if params.image_height == 0 || params.image_width == 0 {
      Some(format!(
        "图像尺寸 {}x{}",
        params.image_height, params.image_width
      ))
    } else if params.ratios.is_empty() || params.ratios.iter().any(|&r| !(r > 0.0)) {
      Some(format!("宽高比 {:?}", params.ratios))
    } else if params.scales.iter().any(|&s| !(s > 0.0)) {
      Some(format!("尺度 {:?}", params.scales))
    } else if params.strides.contains(&0) || params.anchor_stride == 0 {
      Some(format!(
        "步长 {:?} / {}",
        params.strides, params.anchor_stride
      ))
    } else {
      None
    };
    if let Some(reason) = zero_area {
      error!("锚框参数无效: {}", reason);
      return Err(AnchorError::ZeroArea(reason));
    }

    Ok(AnchorGenerator { params })
  }

  pub fn params(&self) -> &AnchorParams {
    &self.params
  }

  /// 第 `level` 层特征图尺寸 `(ceil(H / stride), ceil(W / stride))`
  pub fn feature_shape(&self, level: usize) -> (usize, usize) {
    let stride = self.params.strides[level];
    (
      self.params.image_height.div_ceil(stride) as usize,
      self.params.image_width.div_ceil(stride) as usize,
    )
  }

  /// 全部锚框数量
  pub fn count(&self) -> usize {
    let step = self.params.anchor_stride as usize;
    (0..self.params.strides.len())
      .map(|level| {
        let (h, w) = self.feature_shape(level);
        h.div_ceil(step) * w.div_ceil(step) * self.params.ratios.len()
      })
      .sum()
  }

  pub fn generate(&self) -> AnchorSet {
    let p = &self.params;
    let image_h = p.image_height as f32;
    let image_w = p.image_width as f32;
    let step = p.anchor_stride as usize;

    let mut anchors = Vec::with_capacity(self.count());
    for (level, (&scale, &stride)) in p.scales.iter().zip(&p.strides).enumerate() {
      let (grid_h, grid_w) = self.feature_shape(level);
      let stride = stride as f32;
      // 每个宽高比下的 (高, 宽)
      let sizes: Vec<(f32, f32)> = p
        .ratios
        .iter()
        .map(|&ratio| (scale / ratio.sqrt(), scale * ratio.sqrt()))
        .collect();

      let before = anchors.len();
      for row in (0..grid_h).step_by(step) {
        let center_y = (row as f32 + 0.5) * stride;
        for col in (0..grid_w).step_by(step) {
          let center_x = (col as f32 + 0.5) * stride;
          for &(h, w) in &sizes {
            anchors.push(BBox::new(
              (center_y - 0.5 * h) / image_h,
              (center_x - 0.5 * w) / image_w,
              (center_y + 0.5 * h) / image_h,
              (center_x + 0.5 * w) / image_w,
            ));
          }
        }
      }
      debug!(
        "金字塔第 {} 层: 步长 {}, 网格 {}x{}, 锚框 {} 个",
        level,
        stride,
        grid_h,
        grid_w,
        anchors.len() - before
      );
    }

    AnchorSet {
      boxes: anchors.into(),
    }
  }
}

/// 一次构建、只读共享的锚框集合
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
  boxes: Arc<[BBox]>,
}

/// 与锚框成对出现的 RPN 输出
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredAnchor {
  pub index: usize,
  pub anchor: BBox,
  pub probability: f32,
  pub delta: Delta,
}

impl AnchorSet {
  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  pub fn as_slice(&self) -> &[BBox] {
    &self.boxes
  }

  /// 将单张图像的前景概率 `[N]` 与回归量 `[N, 4]` 按位置与锚框配对
  pub fn pair(
    &self,
    probs: ArrayView1<f32>,
    deltas: ArrayView2<f32>,
  ) -> Result<Vec<ScoredAnchor>, AnchorError> {
    if probs.len() != self.len() || deltas.shape() != [self.len(), 4] {
      error!(
        "锚框数量 {} 与网络输出不一致: 概率 {}, 回归量 {:?}",
        self.len(),
        probs.len(),
        deltas.shape()
      );
      return Err(AnchorError::OutputMismatch {
        anchors: self.len(),
        probs: probs.len(),
        deltas: deltas.shape().to_vec(),
      });
    }

    Ok(
      self
        .boxes
        .iter()
        .zip(probs.iter().zip(deltas.rows()))
        .enumerate()
        .map(|(index, (&anchor, (&probability, delta)))| ScoredAnchor {
          index,
          anchor,
          probability,
          delta: Delta::new(delta[0], delta[1], delta[2], delta[3]),
        })
        .collect(),
    )
  }
}

impl std::ops::Index<usize> for AnchorSet {
  type Output = BBox;

  fn index(&self, index: usize) -> &BBox {
    &self.boxes[index]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array1, Array2};

  fn params() -> AnchorParams {
    AnchorParams {
      scales: vec![32.0, 64.0],
      ratios: vec![0.5, 1.0, 2.0],
      strides: vec![16, 32],
      anchor_stride: 1,
      image_height: 100,
      image_width: 64,
    }
  }

  #[test]
  fn count_matches_formula() {
    let generator = AnchorGenerator::new(params()).unwrap();
    // ceil(100/16)=7, 64/16=4; ceil(100/32)=4, 64/32=2
    assert_eq!(generator.feature_shape(0), (7, 4));
    assert_eq!(generator.feature_shape(1), (4, 2));
    assert_eq!(generator.count(), 7 * 4 * 3 + 4 * 2 * 3);
    assert_eq!(generator.generate().len(), generator.count());
  }

  #[test]
  fn anchor_stride_skips_cells() {
    let generator = AnchorGenerator::new(AnchorParams {
      anchor_stride: 2,
      ..params()
    })
    .unwrap();
    // 行 0,2,4,6 列 0,2；行 0,2 列 0
    assert_eq!(generator.count(), 4 * 2 * 3 + 2 * 1 * 3);
    assert_eq!(generator.generate().len(), generator.count());
  }

  #[test]
  fn generation_is_deterministic() {
    let a = AnchorGenerator::new(params()).unwrap().generate();
    let b = AnchorGenerator::new(params()).unwrap().generate();
    let bits = |s: &AnchorSet| -> Vec<u32> {
      s.as_slice()
        .iter()
        .flat_map(|b| b.to_array())
        .map(f32::to_bits)
        .collect()
    };
    assert_eq!(bits(&a), bits(&b));
  }

  #[test]
  fn anchors_have_positive_extent() {
    for anchor in AnchorGenerator::new(params()).unwrap().generate().as_slice() {
      assert!(anchor.y1 < anchor.y2 && anchor.x1 < anchor.x2);
    }
  }

  #[test]
  fn first_anchors_follow_ratio_order() {
    let anchors = AnchorGenerator::new(params()).unwrap().generate();
    // 第一个单元中心 (8, 8)，宽高比 1 时 32x32
    let square = anchors[1];
    assert!((square.y1 - (8.0 - 16.0) / 100.0).abs() < 1e-6);
    assert!((square.x2 - (8.0 + 16.0) / 64.0).abs() < 1e-6);
    // 宽高比 0.5 更高，宽高比 2 更宽
    assert!(anchors[0].height() * 100.0 > anchors[0].width() * 64.0);
    assert!(anchors[2].width() * 64.0 > anchors[2].height() * 100.0);
    // 第二个单元在同一行的下一列
    assert!((anchors[4].center_x() - 24.0 / 64.0).abs() < 1e-6);
  }

  #[test]
  fn zero_area_parameters_rejected() {
    let bad = AnchorParams {
      scales: vec![0.0, 64.0],
      ..params()
    };
    assert!(matches!(AnchorGenerator::new(bad), Err(AnchorError::ZeroArea(_))));

    let bad = AnchorParams {
      strides: vec![16],
      ..params()
    };
    assert!(matches!(
      AnchorGenerator::new(bad),
      Err(AnchorError::LevelMismatch { .. })
    ));
  }

  #[test]
  fn pair_checks_lengths() {
    let anchors = AnchorGenerator::new(params()).unwrap().generate();
    let n = anchors.len();
    let probs = Array1::from_elem(n, 0.5f32);
    let deltas = Array2::<f32>::zeros((n, 4));
    let paired = anchors.pair(probs.view(), deltas.view()).unwrap();
    assert_eq!(paired.len(), n);
    assert_eq!(paired[5].anchor, anchors[5]);
    assert_eq!(paired[5].index, 5);

    let short = Array1::from_elem(n - 1, 0.5f32);
    assert!(anchors.pair(short.view(), deltas.view()).is_err());
  }
}
