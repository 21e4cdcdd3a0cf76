// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
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

use std::marker::PhantomData;

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::WithLabel,
  pipeline::{PipelineInput, PipelineOutput},
  results::decode_results,
  stage::StageError,
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数 {0} 解析失败")]
  InvalidParameter(String),
  #[error("结果解码错误: {0}")]
  DecodeError(#[from] StageError),
}

/// 将检测结果逐条写入日志
///
/// `log://?min_score=0.5` 只输出分数不低于给定值的检测。
#[derive(Debug, Clone)]
pub struct LogRender<T> {
  min_score: f32,
  _label: PhantomData<T>,
}

impl<T> Default for LogRender<T> {
  fn default() -> Self {
    LogRender {
      min_score: 0.0,
      _label: PhantomData,
    }
  }
}

impl<T> LogRender<T> {
  pub fn with_min_score(mut self, min_score: f32) -> Self {
    self.min_score = min_score;
    self
  }
}

impl<T> FromUrlWithScheme for LogRender<T> {
  const SCHEME: &'static str = "log";
}

impl<T> FromUrl for LogRender<T> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(OutputError::SchemeMismatch);
    }

    let mut render = LogRender::default();
    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "min_score") {
      render.min_score = v.parse().map_err(|_| {
        error!("min_score 参数无法解析: {}", v);
        OutputError::InvalidParameter(format!("min_score={}", v))
      })?;
    }
    Ok(render)
  }
}

impl<T: WithLabel> Render<PipelineInput, PipelineOutput> for LogRender<T> {
  type Error = OutputError;

  fn render_result(
    &self,
    frame: &PipelineInput,
    result: &PipelineOutput,
  ) -> Result<(), Self::Error> {
    let shape = frame.images.shape();
    let results = decode_results::<T>(result, (shape[1] as u32, shape[2] as u32))?;
    for (index, image) in results.iter().enumerate() {
      let id = image.image_id.as_deref().unwrap_or("-");
      info!("图像 #{} ({}): {} 个检测", index, id, image.len());
      for item in image.items.iter().filter(|item| item.score >= self.min_score) {
        info!(
          "  {} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
          item.kind.to_label_str(),
          item.score,
          item.bbox[0],
          item.bbox[1],
          item.bbox[2],
          item.bbox[3]
        );
      }
    }
    Ok(())
  }
}
