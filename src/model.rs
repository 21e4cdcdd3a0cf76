// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型与外部网络头
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

use ndarray::{Array2, Array3, Array4, Array5, ArrayView3, ArrayView4};

use crate::stage::{DEFAULT_MASK_THRESHOLD, unmold_mask};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 每层一个 `[batch, H_l, W_l, C]` 特征图，顺序与配置的步长一致
pub type FeatureMaps = Vec<Array4<f32>>;

/// 骨干网络与特征金字塔
pub trait Backbone {
  type Error: std::error::Error + Send + Sync + 'static;

  fn extract(&self, images: ArrayView4<f32>) -> Result<FeatureMaps, Self::Error>;
}

/// RPN 头输出，按锚框顺序扁平化
#[derive(Debug, Clone)]
pub struct RpnOutput {
  /// `[batch, anchors]` 前景概率
  pub probs: Array2<f32>,
  /// `[batch, anchors, 4]`
  pub deltas: Array3<f32>,
}

pub trait RpnHead {
  type Error: std::error::Error + Send + Sync + 'static;

  fn predict(&self, feature_maps: &[Array4<f32>]) -> Result<RpnOutput, Self::Error>;
}

/// 分类头输出
#[derive(Debug, Clone)]
pub struct Classifications {
  /// `[batch, rois, num_classes]`
  pub probs: Array3<f32>,
  /// `[batch, rois, num_classes * 4]`
  pub deltas: Array3<f32>,
}

pub trait ClassifierHead {
  type Error: std::error::Error + Send + Sync + 'static;

  fn classify(
    &self,
    rois: ArrayView3<f32>,
    feature_maps: &[Array4<f32>],
  ) -> Result<Classifications, Self::Error>;
}

pub trait MaskHead {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 返回 `[batch, max_detections, num_classes, mask_h, mask_w]`
  fn predict_masks(
    &self,
    detections: ArrayView3<f32>,
    feature_maps: &[Array4<f32>],
  ) -> Result<Array5<f32>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: [f32; 4], // [y1, x1, y2, x2]，原图像素坐标
  /// 该类别的掩码概率网格
  pub mask: Array2<f32>,
}

impl<T> DetectItem<T> {
  /// 将掩码还原到 `height x width` 的原图上
  pub fn unmold(&self, height: usize, width: usize) -> Array2<bool> {
    unmold_mask(
      self.mask.view(),
      self.bbox,
      height,
      width,
      DEFAULT_MASK_THRESHOLD,
    )
  }
}

#[derive(Debug, Clone)]
pub struct DetectResult<T> {
  pub image_id: Option<String>,
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn from_label_id(id: u32) -> Self;
}

#[cfg(feature = "coco_label")]
mod coco;
#[cfg(feature = "coco_label")]
pub use self::coco::CocoLabel;
