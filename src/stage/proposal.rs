// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stage/proposal.rs - 候选区域层
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

use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use tracing::debug;

use crate::{
  anchor::{AnchorSet, ScoredAnchor},
  geometry::BBox,
  nms::non_max_suppression,
  stage::StageError,
};

/// 候选区域层参数
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalParams {
  /// NMS 前按前景概率保留的锚框数，只为节省计算，但小于锚框总数时会改变结果
  pub pre_nms_max_proposals: usize,
  pub max_proposals: usize,
  pub nms_threshold: f32,
  /// 前景概率必须严格大于该值
  pub min_score: f32,
  pub bbox_std_dev: [f32; 4],
}

/// 候选区域层
///
/// 输入每个锚框的前景概率与回归量，输出 `[batch, max_proposals, 4]`，
/// 行顺序即 NMS 选取顺序，不足部分以全零行填充。
#[derive(Debug, Clone)]
pub struct ProposalLayer {
  params: ProposalParams,
}

impl ProposalLayer {
  pub fn new(params: ProposalParams) -> Self {
    ProposalLayer { params }
  }

  pub fn params(&self) -> &ProposalParams {
    &self.params
  }

  /// 单张图像的候选框，未填充
  pub fn propose(&self, mut scored: Vec<ScoredAnchor>) -> Vec<BBox> {
    let p = &self.params;

    scored.retain(|s| s.probability > p.min_score);
    // 稳定排序，同分时锚框下标小者在前
    scored.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    scored.truncate(p.pre_nms_max_proposals);

    let boxes: Vec<BBox> = scored
      .iter()
      .map(|s| {
        s.anchor
          .apply_delta(&s.delta.scale(&p.bbox_std_dev))
          .clip(&BBox::UNIT)
      })
      .collect();
    let scores: Vec<f32> = scored.iter().map(|s| s.probability).collect();

    let keep = non_max_suppression(&boxes, &scores, p.nms_threshold, p.max_proposals);
    debug!(
      "候选框: NMS 前 {} 个, NMS 后 {} 个",
      boxes.len(),
      keep.len()
    );
    keep.into_iter().map(|i| boxes[i]).collect()
  }

  /// 批量处理 `probs [B, N]` 与 `deltas [B, N, 4]`
  pub fn forward(
    &self,
    anchors: &AnchorSet,
    probs: ArrayView2<f32>,
    deltas: ArrayView3<f32>,
  ) -> Result<Array3<f32>, StageError> {
    let batch = probs.shape()[0];
    if deltas.shape()[0] != batch {
      return Err(StageError::shape(
        "rpn deltas",
        &[batch, anchors.len(), 4],
        deltas.shape(),
      ));
    }

    let mut output = Array3::<f32>::zeros((batch, self.params.max_proposals, 4));
    for (image, mut rows) in output.axis_iter_mut(Axis(0)).enumerate() {
      let scored = anchors.pair(
        probs.index_axis(Axis(0), image),
        deltas.index_axis(Axis(0), image),
      )?;
      for (mut row, bbox) in rows.rows_mut().into_iter().zip(self.propose(scored)) {
        row.assign(&ndarray::aview1(&bbox.to_array()));
      }
    }

    Ok(output)
  }
}
