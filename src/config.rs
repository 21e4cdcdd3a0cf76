// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 流水线配置
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
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  anchor::AnchorParams,
  stage::{DetectionParams, ProposalParams},
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无法转换为本地路径: {0}")]
  InvalidPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("配置项 {key} 无效: {reason}")]
  Invalid { key: &'static str, reason: String },
}

impl ConfigError {
  fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
    let reason = reason.into();
    error!("配置项 {} 无效: {}", key, reason);
    ConfigError::Invalid { key, reason }
  }
}

/// 骨干网络结构
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
  Resnet50,
  Resnet101,
}

/// 扁平的键值配置
///
/// 未知键被忽略，缺失的键取默认值。构建流水线时调用 [`Config::validate`]，
/// 之后各组件只拿到各自需要的参数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub architecture: Architecture,
  pub input_height: u32,
  pub input_width: u32,
  /// 含背景类 0
  pub num_classes: usize,
  pub pre_nms_max_proposals: usize,
  pub max_proposals: usize,
  pub max_detections: usize,
  pub pyramid_top_down_size: usize,
  pub proposal_nms_threshold: f32,
  /// 前景概率不大于该值的锚框不参与候选
  pub proposal_min_score: f32,
  pub detection_min_confidence: f32,
  pub detection_nms_threshold: f32,
  pub bounding_box_std_dev: [f32; 4],
  pub classifier_pool_size: usize,
  pub mask_pool_size: usize,
  pub fc_layers_size: usize,
  pub anchor_scales: Vec<f32>,
  pub anchor_ratios: Vec<f32>,
  pub backbone_strides: Vec<u32>,
  pub anchor_stride: u32,
  /// 分类头与掩码头使用的前若干层金字塔特征
  pub head_pyramid_levels: usize,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      architecture: Architecture::Resnet101,
      input_height: 1024,
      input_width: 1024,
      num_classes: 1 + 80,
      pre_nms_max_proposals: 6000,
      max_proposals: 1000,
      max_detections: 100,
      pyramid_top_down_size: 256,
      proposal_nms_threshold: 0.7,
      proposal_min_score: 0.0,
      detection_min_confidence: 0.7,
      detection_nms_threshold: 0.3,
      bounding_box_std_dev: [0.1, 0.1, 0.2, 0.2],
      classifier_pool_size: 7,
      mask_pool_size: 14,
      fc_layers_size: 1024,
      anchor_scales: vec![32.0, 64.0, 128.0, 256.0, 512.0],
      anchor_ratios: vec![0.5, 1.0, 2.0],
      backbone_strides: vec![4, 8, 16, 32, 64],
      anchor_stride: 1,
      head_pyramid_levels: 4,
    }
  }
}

impl FromUrlWithScheme for Config {
  const SCHEME: &'static str = "file";
}

impl FromUrl for Config {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch);
    }

    let path = url.to_file_path().map_err(|_| {
      error!("无法转换为本地路径: {}", url);
      ConfigError::InvalidPath(url.to_string())
    })?;
    info!("加载配置文件: {}", path.display());
    let text = std::fs::read_to_string(&path)?;
    Config::from_json_str(&text)
  }
}

impl Config {
  pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
    let config: Config = serde_json::from_str(text)?;
    debug!("配置内容: {:?}", config);
    Ok(config)
  }

  /// 检查配置，任何一项不合法都直接失败
  pub fn validate(self) -> Result<Self, ConfigError> {
    if self.input_height == 0 || self.input_width == 0 {
      return Err(ConfigError::invalid("input_height/input_width", "输入尺寸必须为正"));
    }
    if self.num_classes < 2 {
      return Err(ConfigError::invalid(
        "num_classes",
        format!("至少需要背景类和一个前景类, 实际为 {}", self.num_classes),
      ));
    }
    for (key, value) in [
      ("pre_nms_max_proposals", self.pre_nms_max_proposals),
      ("max_proposals", self.max_proposals),
      ("max_detections", self.max_detections),
    ] {
      if value == 0 {
        return Err(ConfigError::invalid(key, "数量上限必须为正"));
      }
    }
    for (key, value) in [
      ("proposal_nms_threshold", self.proposal_nms_threshold),
      ("proposal_min_score", self.proposal_min_score),
      ("detection_min_confidence", self.detection_min_confidence),
      ("detection_nms_threshold", self.detection_nms_threshold),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(key, format!("阈值 {} 不在 [0, 1] 内", value)));
      }
    }
    if self.bounding_box_std_dev.iter().any(|&v| !(v > 0.0)) {
      return Err(ConfigError::invalid(
        "bounding_box_std_dev",
        format!("{:?} 必须全部为正", self.bounding_box_std_dev),
      ));
    }
    if self.backbone_strides.is_empty() {
      return Err(ConfigError::invalid("backbone_strides", "至少需要一层金字塔"));
    }
    if self.anchor_scales.len() != self.backbone_strides.len() {
      return Err(ConfigError::invalid(
        "anchor_scales",
        format!(
          "尺度数量 {} 与金字塔层数 {} 不一致",
          self.anchor_scales.len(),
          self.backbone_strides.len()
        ),
      ));
    }
    if self.backbone_strides.contains(&0) {
      return Err(ConfigError::invalid("backbone_strides", "步长必须为正"));
    }
    if self.anchor_stride == 0 {
      return Err(ConfigError::invalid("anchor_stride", "步长必须为正"));
    }
    if self.anchor_ratios.is_empty() || self.anchor_ratios.iter().any(|&r| !(r > 0.0)) {
      return Err(ConfigError::invalid(
        "anchor_ratios",
        format!("{:?} 必须非空且全部为正", self.anchor_ratios),
      ));
    }
    if self.anchor_scales.iter().any(|&s| !(s > 0.0)) {
      return Err(ConfigError::invalid(
        "anchor_scales",
        format!("{:?} 会产生零面积锚框", self.anchor_scales),
      ));
    }
    if self.head_pyramid_levels == 0 || self.head_pyramid_levels > self.backbone_strides.len() {
      return Err(ConfigError::invalid(
        "head_pyramid_levels",
        format!(
          "{} 不在 1..={} 内",
          self.head_pyramid_levels,
          self.backbone_strides.len()
        ),
      ));
    }

    Ok(self)
  }

  pub fn pyramid_levels(&self) -> usize {
    self.backbone_strides.len()
  }

  pub fn anchors_per_location(&self) -> usize {
    self.anchor_ratios.len()
  }

  /// 掩码头输出网格大小，为池化尺寸的两倍
  pub fn mask_shape(&self) -> (usize, usize) {
    (self.mask_pool_size * 2, self.mask_pool_size * 2)
  }

  pub fn anchor_params(&self) -> AnchorParams {
    AnchorParams {
      scales: self.anchor_scales.clone(),
      ratios: self.anchor_ratios.clone(),
      strides: self.backbone_strides.clone(),
      anchor_stride: self.anchor_stride,
      image_height: self.input_height,
      image_width: self.input_width,
    }
  }

  pub fn proposal_params(&self) -> ProposalParams {
    ProposalParams {
      pre_nms_max_proposals: self.pre_nms_max_proposals,
      max_proposals: self.max_proposals,
      nms_threshold: self.proposal_nms_threshold,
      min_score: self.proposal_min_score,
      bbox_std_dev: self.bounding_box_std_dev,
    }
  }

  pub fn detection_params(&self) -> DetectionParams {
    DetectionParams {
      num_classes: self.num_classes,
      max_detections: self.max_detections,
      bbox_std_dev: self.bounding_box_std_dev,
      min_confidence: self.detection_min_confidence,
      nms_threshold: self.detection_nms_threshold,
    }
  }
}
