// 该文件是 Shanan （山南西风） 项目的一部分。
// src/replay.rs - 回放预先记录的网络头输出
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

//! 在没有推理后端的情况下驱动整条流水线。
//!
//! 记录文件是 JSON，保存 RPN 与分类头对一批图像的输出。回放时骨干网络只产生
//! 形状正确的全零特征图，掩码头输出常数网格。

use std::sync::Arc;

use ndarray::{Array2, Array3, Array4, Array5, ArrayView3, ArrayView4, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::Config,
  model::{Backbone, Classifications, ClassifierHead, FeatureMaps, MaskHead, RpnHead, RpnOutput},
  pipeline::{Environment, Passthrough, PipelineInput},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("记录路径解码失败: {0}")]
  InvalidPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("记录字段 {field} 形状不规整: {reason}")]
  Ragged { field: &'static str, reason: String },
  #[error("批大小不一致 ({what}): 期望 {expected}, 实际 {actual}")]
  BatchMismatch {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
}

impl ReplayError {
  fn ragged(field: &'static str, reason: impl Into<String>) -> Self {
    let reason = reason.into();
    error!("记录字段 {} 形状不规整: {}", field, reason);
    ReplayError::Ragged { field, reason }
  }

  fn batch(what: &'static str, expected: usize, actual: usize) -> Self {
    error!("批大小不一致 ({}): 期望 {}, 实际 {}", what, expected, actual);
    ReplayError::BatchMismatch {
      what,
      expected,
      actual,
    }
  }
}

fn default_mask_value() -> f32 {
  1.0
}

/// 一次推理的网络头输出记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
  /// `[batch][anchors]`
  pub rpn_probs: Vec<Vec<f32>>,
  /// `[batch][anchors]`
  pub rpn_deltas: Vec<Vec<[f32; 4]>>,
  /// `[batch][rows][num_classes]`，行数少于候选框数时其余候选框视为背景
  pub class_probs: Vec<Vec<Vec<f32>>>,
  /// `[batch][rows][num_classes * 4]`
  pub class_deltas: Vec<Vec<Vec<f32>>>,
  #[serde(default = "default_mask_value")]
  pub mask_value: f32,
  #[serde(default)]
  pub image_ids: Option<Vec<String>>,
  #[serde(default)]
  pub windows: Option<Vec<[f32; 4]>>,
  #[serde(default)]
  pub original_shapes: Option<Vec<[u32; 3]>>,
}

impl FromUrlWithScheme for Recording {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for Recording {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch);
    }

    let path = urlencoding::decode(url.path()).map_err(|e| {
      error!("记录路径解码失败: {}: {}", url.path(), e);
      ReplayError::InvalidPath(url.path().to_string())
    })?;
    info!("加载回放记录: {}", path);
    let text = std::fs::read_to_string(&*path)?;
    Recording::from_json_str(&text)
  }
}

impl Recording {
  pub fn from_json_str(text: &str) -> Result<Self, ReplayError> {
    let recording: Recording = serde_json::from_str(text)?;
    debug!(
      "回放记录: {} 张图像, 每张 {} 个锚框",
      recording.batch_size(),
      recording.rpn_probs.first().map(Vec::len).unwrap_or(0)
    );
    Ok(recording)
  }

  pub fn batch_size(&self) -> usize {
    self.rpn_probs.len()
  }

  /// 构造与记录批大小一致的全零图像输入
  ///
  /// estimator 环境下缺省的透传字段分别取序号、整幅窗口和输入尺寸。
  pub fn input(
    &self,
    config: &Config,
    environment: Environment,
  ) -> Result<PipelineInput, ReplayError> {
    let batch = self.batch_size();
    let (height, width) = (config.input_height, config.input_width);
    let images = Array4::<f32>::zeros((batch, height as usize, width as usize, 3));

    match environment {
      Environment::Embedded => Ok(PipelineInput::embedded(images)),
      Environment::Estimator => {
        let image_ids = match &self.image_ids {
          Some(ids) if ids.len() != batch => {
            return Err(ReplayError::batch("image_ids", batch, ids.len()));
          }
          Some(ids) => ids.clone(),
          None => (0..batch).map(|i| i.to_string()).collect(),
        };
        let windows = match &self.windows {
          Some(w) if w.len() != batch => {
            return Err(ReplayError::batch("windows", batch, w.len()));
          }
          Some(w) => w.clone(),
          None => vec![[0.0, 0.0, 1.0, 1.0]; batch],
        };
        let original_shapes = match &self.original_shapes {
          Some(s) if s.len() != batch => {
            return Err(ReplayError::batch("original_shapes", batch, s.len()));
          }
          Some(s) => s.clone(),
          None => vec![[height, width, 3]; batch],
        };
        let windows = Array2::from_shape_fn((batch, 4), |(i, j)| windows[i][j]);
        Ok(PipelineInput::estimator(
          images,
          Passthrough {
            image_ids,
            windows,
            original_shapes,
          },
        ))
      }
    }
  }
}

fn to_array2(field: &'static str, data: &[Vec<f32>]) -> Result<Array2<f32>, ReplayError> {
  let cols = data.first().map(Vec::len).unwrap_or(0);
  if let Some(row) = data.iter().find(|row| row.len() != cols) {
    return Err(ReplayError::ragged(
      field,
      format!("行长度 {} 与首行 {} 不一致", row.len(), cols),
    ));
  }
  Ok(Array2::from_shape_fn((data.len(), cols), |(i, j)| data[i][j]))
}

fn to_array3(
  field: &'static str,
  data: &[Vec<Vec<f32>>],
  width: usize,
) -> Result<Array3<f32>, ReplayError> {
  let rows = data.first().map(Vec::len).unwrap_or(0);
  for image in data {
    if image.len() != rows {
      return Err(ReplayError::ragged(
        field,
        format!("行数 {} 与首张图像 {} 不一致", image.len(), rows),
      ));
    }
    if let Some(row) = image.iter().find(|row| row.len() != width) {
      return Err(ReplayError::ragged(
        field,
        format!("行宽度 {} 应为 {}", row.len(), width),
      ));
    }
  }
  Ok(Array3::from_shape_fn((data.len(), rows, width), |(i, r, c)| {
    data[i][r][c]
  }))
}

#[derive(Debug)]
struct Recorded {
  rpn: RpnOutput,
  class_probs: Array3<f32>,
  class_deltas: Array3<f32>,
  mask_value: f32,
  strides: Vec<u32>,
  num_classes: usize,
  mask_shape: (usize, usize),
}

/// 以记录数据实现全部四个网络接口，可多处克隆共享
#[derive(Debug, Clone)]
pub struct RecordedHeads {
  inner: Arc<Recorded>,
}

impl RecordedHeads {
  pub fn new(recording: &Recording, config: &Config) -> Result<Self, ReplayError> {
    let batch = recording.batch_size();
    let rpn_probs = to_array2("rpn_probs", &recording.rpn_probs)?;

    if recording.rpn_deltas.len() != batch {
      return Err(ReplayError::batch("rpn_deltas", batch, recording.rpn_deltas.len()));
    }
    let anchors = rpn_probs.shape()[1];
    if let Some(image) = recording.rpn_deltas.iter().find(|d| d.len() != anchors) {
      return Err(ReplayError::ragged(
        "rpn_deltas",
        format!("锚框数 {} 应为 {}", image.len(), anchors),
      ));
    }
    let rpn_deltas = Array3::from_shape_fn((batch, anchors, 4), |(i, a, k)| {
      recording.rpn_deltas[i][a][k]
    });

    let num_classes = config.num_classes;
    let class_probs = to_array3("class_probs", &recording.class_probs, num_classes)?;
    let class_deltas = to_array3("class_deltas", &recording.class_deltas, num_classes * 4)?;
    if class_probs.shape()[0] != batch {
      return Err(ReplayError::batch("class_probs", batch, class_probs.shape()[0]));
    }
    if class_deltas.shape()[..2] != class_probs.shape()[..2] {
      return Err(ReplayError::ragged(
        "class_deltas",
        format!(
          "形状 {:?} 与 class_probs {:?} 不对应",
          class_deltas.shape(),
          class_probs.shape()
        ),
      ));
    }

    Ok(RecordedHeads {
      inner: Arc::new(Recorded {
        rpn: RpnOutput {
          probs: rpn_probs,
          deltas: rpn_deltas,
        },
        class_probs,
        class_deltas,
        mask_value: recording.mask_value,
        strides: config.backbone_strides.clone(),
        num_classes,
        mask_shape: config.mask_shape(),
      }),
    })
  }

  fn batch_size(&self) -> usize {
    self.inner.rpn.probs.shape()[0]
  }
}

impl Backbone for RecordedHeads {
  type Error = ReplayError;

  fn extract(&self, images: ArrayView4<f32>) -> Result<FeatureMaps, Self::Error> {
    let (batch, height, width, _) = images.dim();
    Ok(
      self
        .inner
        .strides
        .iter()
        .map(|&stride| {
          let stride = stride as usize;
          Array4::zeros((batch, height.div_ceil(stride), width.div_ceil(stride), 1))
        })
        .collect(),
    )
  }
}

impl RpnHead for RecordedHeads {
  type Error = ReplayError;

  fn predict(&self, feature_maps: &[Array4<f32>]) -> Result<RpnOutput, Self::Error> {
    let batch = feature_maps.first().map(|m| m.shape()[0]).unwrap_or(0);
    if batch != self.batch_size() {
      return Err(ReplayError::batch("rpn", self.batch_size(), batch));
    }
    Ok(self.inner.rpn.clone())
  }
}

impl ClassifierHead for RecordedHeads {
  type Error = ReplayError;

  fn classify(
    &self,
    rois: ArrayView3<f32>,
    _feature_maps: &[Array4<f32>],
  ) -> Result<Classifications, Self::Error> {
    let (batch, regions, _) = rois.dim();
    if batch != self.batch_size() {
      return Err(ReplayError::batch("classifier", self.batch_size(), batch));
    }

    let classes = self.inner.num_classes;
    let rows = self.inner.class_probs.shape()[1].min(regions);
    let mut probs = Array3::<f32>::zeros((batch, regions, classes));
    let mut deltas = Array3::<f32>::zeros((batch, regions, classes * 4));
    probs
      .slice_mut(s![.., ..rows, ..])
      .assign(&self.inner.class_probs.slice(s![.., ..rows, ..]));
    deltas
      .slice_mut(s![.., ..rows, ..])
      .assign(&self.inner.class_deltas.slice(s![.., ..rows, ..]));

    Ok(Classifications { probs, deltas })
  }
}

impl MaskHead for RecordedHeads {
  type Error = ReplayError;

  fn predict_masks(
    &self,
    detections: ArrayView3<f32>,
    _feature_maps: &[Array4<f32>],
  ) -> Result<Array5<f32>, Self::Error> {
    let (batch, slots, _) = detections.dim();
    let (mh, mw) = self.inner.mask_shape;
    Ok(Array5::from_elem(
      (batch, slots, self.inner.num_classes, mh, mw),
      self.inner.mask_value,
    ))
  }
}
