// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 两阶段检测流水线组装
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

use std::{fmt, str::FromStr};

use ndarray::{Array2, Array3, Array4, Array5};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl,
  anchor::{AnchorError, AnchorGenerator, AnchorSet},
  config::{Config, ConfigError},
  geometry::BBox,
  model::{Backbone, ClassifierHead, MaskHead, Model, RpnHead},
  stage::{Detection, DetectionLayer, ProposalLayer, StageError},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("锚框错误: {0}")]
  AnchorError(#[from] AnchorError),
  #[error("阶段错误: {0}")]
  StageError(#[from] StageError),
  #[error("未知运行环境: {0}")]
  UnknownEnvironment(String),
  #[error("特征图数量不匹配: 期望 {expected}, 实际 {actual}")]
  FeatureMapCount { expected: usize, actual: usize },
  #[error("第 {level} 层特征图形状不匹配: 期望 [{batch}, {height}, {width}, _], 实际 {actual:?}")]
  FeatureMapShape {
    level: usize,
    batch: usize,
    height: usize,
    width: usize,
    actual: Vec<usize>,
  },
  #[error("输入形状不匹配 ({what}): 期望 {expected:?}, 实际 {actual:?}")]
  InputShape {
    what: &'static str,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("{0} 环境需要透传数据")]
  PassthroughMissing(Environment),
  #[error("{0} 环境不接受透传数据")]
  PassthroughUnexpected(Environment),
  #[error("{stage} 执行错误: {source}")]
  HeadError {
    stage: &'static str,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl PipelineError {
  fn head<E: std::error::Error + Send + Sync + 'static>(stage: &'static str, err: E) -> Self {
    error!("{} 执行失败: {}", stage, err);
    PipelineError::HeadError {
      stage,
      source: Box::new(err),
    }
  }

  fn input_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
    error!(
      "输入形状不匹配 ({}): 期望 {:?}, 实际 {:?}",
      what, expected, actual
    );
    PipelineError::InputShape {
      what,
      expected: expected.to_vec(),
      actual: actual.to_vec(),
    }
  }
}

/// 运行环境，构建时确定，只决定透传哪些辅助张量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
  /// 训练与离线评估：透传图像标识、有效窗口和原始尺寸
  Estimator,
  /// 端侧推理：只有图像输入
  #[default]
  Embedded,
}

impl FromStr for Environment {
  type Err = PipelineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tf.estimator" | "estimator" => Ok(Environment::Estimator),
      "coreml" | "embedded" => Ok(Environment::Embedded),
      other => {
        error!("未知运行环境: {}", other);
        Err(PipelineError::UnknownEnvironment(other.to_string()))
      }
    }
  }
}

impl fmt::Display for Environment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Environment::Estimator => write!(f, "estimator"),
      Environment::Embedded => write!(f, "embedded"),
    }
  }
}

/// 离线评估用的透传数据，原样出现在输出中
#[derive(Debug, Clone, PartialEq)]
pub struct Passthrough {
  pub image_ids: Vec<String>,
  /// `[batch, 4]` 原图在模型输入中的归一化区域，检测框裁剪到该区域
  pub windows: Array2<f32>,
  /// 原图 `(height, width, channels)`
  pub original_shapes: Vec<[u32; 3]>,
}

#[derive(Debug, Clone)]
pub struct PipelineInput {
  /// `[batch, height, width, 3]`
  pub images: Array4<f32>,
  pub passthrough: Option<Passthrough>,
}

impl PipelineInput {
  pub fn embedded(images: Array4<f32>) -> Self {
    PipelineInput {
      images,
      passthrough: None,
    }
  }

  pub fn estimator(images: Array4<f32>, passthrough: Passthrough) -> Self {
    PipelineInput {
      images,
      passthrough: Some(passthrough),
    }
  }

  pub fn batch_size(&self) -> usize {
    self.images.shape()[0]
  }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
  pub passthrough: Option<Passthrough>,
  /// `[batch, max_detections, 6]`，每行 `(y1, x1, y2, x2, class_id, score)`
  pub detections: Array3<f32>,
  /// `[batch, max_detections, num_classes, mask_h, mask_w]`
  pub masks: Array5<f32>,
}

pub struct PipelineBuilder {
  config: Config,
  environment: Environment,
}

impl FromUrl for PipelineBuilder {
  type Error = PipelineError;

  /// `file:///path/config.json?environment=estimator`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config = Config::from_url(url)?;
    let environment = match url.query_pairs().find(|(k, _)| k == "environment") {
      Some((_, v)) => v.parse()?,
      None => Environment::default(),
    };
    Ok(PipelineBuilder {
      config,
      environment,
    })
  }
}

impl PipelineBuilder {
  pub fn new(config: Config) -> Self {
    PipelineBuilder {
      config,
      environment: Environment::default(),
    }
  }

  pub fn environment(mut self, environment: Environment) -> Self {
    self.environment = environment;
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn build<B, R, C, M>(
    self,
    backbone: B,
    rpn: R,
    classifier: C,
    mask_head: M,
  ) -> Result<MaskRcnn<B, R, C, M>, PipelineError>
  where
    B: Backbone,
    R: RpnHead,
    C: ClassifierHead,
    M: MaskHead,
  {
    info!("构建流水线, 运行环境: {}", self.environment);
    let config = self.config.validate()?;

    let generator = AnchorGenerator::new(config.anchor_params())?;
    let anchors = generator.generate();
    info!(
      "锚框生成完成: {} 层, 共 {} 个",
      config.pyramid_levels(),
      anchors.len()
    );

    let feature_shapes = (0..config.pyramid_levels())
      .map(|level| generator.feature_shape(level))
      .collect();

    Ok(MaskRcnn {
      proposal: ProposalLayer::new(config.proposal_params()),
      detection: DetectionLayer::new(config.detection_params()),
      environment: self.environment,
      feature_shapes,
      anchors,
      config,
      backbone,
      rpn,
      classifier,
      mask_head,
    })
  }
}

/// 组装好的两阶段检测流水线
pub struct MaskRcnn<B, R, C, M> {
  config: Config,
  environment: Environment,
  anchors: AnchorSet,
  feature_shapes: Vec<(usize, usize)>,
  proposal: ProposalLayer,
  detection: DetectionLayer,
  backbone: B,
  rpn: R,
  classifier: C,
  mask_head: M,
}

impl<B, R, C, M> MaskRcnn<B, R, C, M> {
  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn environment(&self) -> Environment {
    self.environment
  }

  pub fn anchors(&self) -> &AnchorSet {
    &self.anchors
  }

  fn check_input(&self, input: &PipelineInput) -> Result<(), PipelineError> {
    let batch = input.batch_size();
    let expected = [
      batch,
      self.config.input_height as usize,
      self.config.input_width as usize,
      3,
    ];
    if input.images.shape() != expected {
      return Err(PipelineError::input_shape(
        "images",
        &expected,
        input.images.shape(),
      ));
    }

    match (self.environment, &input.passthrough) {
      (Environment::Estimator, None) => {
        error!("estimator 环境缺少透传数据");
        Err(PipelineError::PassthroughMissing(self.environment))
      }
      (Environment::Embedded, Some(_)) => {
        error!("embedded 环境不接受透传数据");
        Err(PipelineError::PassthroughUnexpected(self.environment))
      }
      (Environment::Estimator, Some(p)) => {
        if p.image_ids.len() != batch {
          return Err(PipelineError::input_shape(
            "image ids",
            &[batch],
            &[p.image_ids.len()],
          ));
        }
        if p.original_shapes.len() != batch {
          return Err(PipelineError::input_shape(
            "original shapes",
            &[batch],
            &[p.original_shapes.len()],
          ));
        }
        if p.windows.shape() != [batch, 4] {
          return Err(PipelineError::input_shape(
            "windows",
            &[batch, 4],
            p.windows.shape(),
          ));
        }
        Ok(())
      }
      (Environment::Embedded, None) => Ok(()),
    }
  }

  fn check_feature_maps(&self, batch: usize, maps: &[Array4<f32>]) -> Result<(), PipelineError> {
    if maps.len() != self.feature_shapes.len() {
      error!(
        "特征图数量不匹配: 期望 {}, 实际 {}",
        self.feature_shapes.len(),
        maps.len()
      );
      return Err(PipelineError::FeatureMapCount {
        expected: self.feature_shapes.len(),
        actual: maps.len(),
      });
    }
    for (level, (map, &(height, width))) in maps.iter().zip(&self.feature_shapes).enumerate() {
      let shape = map.shape();
      if shape[0] != batch || shape[1] != height || shape[2] != width {
        error!(
          "第 {} 层特征图形状不匹配: 期望 [{}, {}, {}, _], 实际 {:?}",
          level, batch, height, width, shape
        );
        return Err(PipelineError::FeatureMapShape {
          level,
          batch,
          height,
          width,
          actual: shape.to_vec(),
        });
      }
    }
    Ok(())
  }
}

impl<B, R, C, M> Model for MaskRcnn<B, R, C, M>
where
  B: Backbone,
  R: RpnHead,
  C: ClassifierHead,
  M: MaskHead,
{
  type Input = PipelineInput;
  type Output = PipelineOutput;
  type Error = PipelineError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.check_input(input)?;
    let batch = input.batch_size();

    debug!("提取特征金字塔");
    let feature_maps = self
      .backbone
      .extract(input.images.view())
      .map_err(|e| PipelineError::head("backbone", e))?;
    self.check_feature_maps(batch, &feature_maps)?;

    debug!("RPN 推理");
    let rpn = self
      .rpn
      .predict(&feature_maps)
      .map_err(|e| PipelineError::head("rpn", e))?;
    if rpn.probs.shape()[0] != batch {
      return Err(PipelineError::from(StageError::shape(
        "rpn probs",
        &[batch, self.anchors.len()],
        rpn.probs.shape(),
      )));
    }
    let rois = self
      .proposal
      .forward(&self.anchors, rpn.probs.view(), rpn.deltas.view())?;

    // 分类头与掩码头不使用最粗的若干层
    let head_maps = &feature_maps[..self.config.head_pyramid_levels];

    debug!("分类头推理");
    let classifications = self
      .classifier
      .classify(rois.view(), head_maps)
      .map_err(|e| PipelineError::head("classifier", e))?;

    let windows = match &input.passthrough {
      Some(p) => p.windows.clone(),
      None => {
        let unit = BBox::UNIT.to_array();
        Array2::from_shape_fn((batch, 4), |(_, j)| unit[j])
      }
    };
    let detections = self.detection.forward(
      rois.view(),
      classifications.probs.view(),
      classifications.deltas.view(),
      windows.view(),
    )?;

    debug!("掩码头推理");
    let masks = self
      .mask_head
      .predict_masks(detections.view(), head_maps)
      .map_err(|e| PipelineError::head("mask", e))?;
    let (mask_h, mask_w) = self.config.mask_shape();
    let expected = [
      batch,
      self.config.max_detections,
      self.config.num_classes,
      mask_h,
      mask_w,
    ];
    if masks.shape() != expected {
      return Err(PipelineError::from(StageError::shape(
        "masks",
        &expected,
        masks.shape(),
      )));
    }

    debug!(
      "推理完成: {} 张图像, 有效检测 {} 个",
      batch,
      detections
        .rows()
        .into_iter()
        .filter(|r| Detection::from_row(r.view()).is_some())
        .count()
    );

    Ok(PipelineOutput {
      passthrough: input.passthrough.clone(),
      detections,
      masks,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn environment_parsing() {
    assert_eq!("tf.estimator".parse::<Environment>().unwrap(), Environment::Estimator);
    assert_eq!("estimator".parse::<Environment>().unwrap(), Environment::Estimator);
    assert_eq!("coreml".parse::<Environment>().unwrap(), Environment::Embedded);
    assert_eq!("embedded".parse::<Environment>().unwrap(), Environment::Embedded);
    assert!(matches!(
      "tflite".parse::<Environment>(),
      Err(PipelineError::UnknownEnvironment(_))
    ));
  }

  #[test]
  fn environment_display_round_trips() {
    for env in [Environment::Estimator, Environment::Embedded] {
      assert_eq!(env.to_string().parse::<Environment>().unwrap(), env);
    }
  }
}
