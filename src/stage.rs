// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stage.rs - 候选框、检测与掩码阶段
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
use tracing::error;

use crate::anchor::AnchorError;

#[derive(Error, Debug)]
pub enum StageError {
  #[error("锚框错误: {0}")]
  AnchorError(#[from] AnchorError),
  #[error("张量形状不匹配 ({what}): 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    what: &'static str,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
}

impl StageError {
  pub fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
    error!(
      "张量形状不匹配 ({}): 期望 {:?}, 实际 {:?}",
      what, expected, actual
    );
    StageError::ShapeMismatch {
      what,
      expected: expected.to_vec(),
      actual: actual.to_vec(),
    }
  }
}

mod detection;
mod mask;
mod proposal;

pub use self::detection::{BACKGROUND_CLASS, Detection, DetectionLayer, DetectionParams};
pub use self::mask::{DEFAULT_MASK_THRESHOLD, select_masks, unmold_mask};
pub use self::proposal::{ProposalLayer, ProposalParams};
