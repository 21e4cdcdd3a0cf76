// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use crate::geometry::BBox;

/// 贪心非极大值抑制
///
/// 按分数降序（同分时原始下标小者优先）依次选取，删除与已选框 IoU
/// 严格大于 `iou_threshold` 的框，选满 `max_output` 个或无框可选时停止。
/// 返回被选中框的下标，顺序即选取顺序；数量可能少于 `max_output`，由调用方填充。
pub fn non_max_suppression(
  boxes: &[BBox],
  scores: &[f32],
  iou_threshold: f32,
  max_output: usize,
) -> Vec<usize> {
  debug_assert_eq!(boxes.len(), scores.len());
  let n = boxes.len().min(scores.len());
  if n == 0 || max_output == 0 {
    return Vec::new();
  }

  // sort_by 是稳定排序，同分保持原始顺序
  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

  let mut keep = Vec::with_capacity(max_output.min(n));
  let mut suppressed = vec![false; n];

  for (pos, &best) in order.iter().enumerate() {
    if suppressed[best] {
      continue;
    }
    keep.push(best);
    if keep.len() >= max_output {
      break;
    }

    let selected = &boxes[best];
    for &other in &order[pos + 1..] {
      if !suppressed[other] && selected.iou(&boxes[other]) > iou_threshold {
        suppressed[other] = true;
      }
    }
  }

  keep
}

#[cfg(test)]
mod tests {
  use super::*;

  fn boxes() -> Vec<BBox> {
    vec![
      BBox::new(0.0, 0.0, 0.5, 0.5),
      BBox::new(0.0, 0.05, 0.5, 0.55),
      BBox::new(0.6, 0.6, 0.9, 0.9),
      BBox::new(0.0, 0.0, 0.5, 0.5),
      BBox::new(0.61, 0.6, 0.9, 0.91),
    ]
  }

  #[test]
  fn empty_input_selects_nothing() {
    assert!(non_max_suppression(&[], &[], 0.5, 10).is_empty());
  }

  #[test]
  fn suppresses_overlapping_lower_scores() {
    let scores = [0.9, 0.8, 0.7, 0.6, 0.95];
    let keep = non_max_suppression(&boxes(), &scores, 0.5, 10);
    assert_eq!(keep, vec![4, 0]);
  }

  #[test]
  fn ties_prefer_lower_index() {
    let b = [BBox::new(0.0, 0.0, 1.0, 1.0), BBox::new(0.0, 0.0, 1.0, 1.0)];
    assert_eq!(non_max_suppression(&b, &[0.5, 0.5], 0.3, 10), vec![0]);
  }

  #[test]
  fn respects_max_output() {
    let b: Vec<BBox> = (0..10)
      .map(|i| {
        let o = i as f32 * 0.1;
        BBox::new(o, o, o + 0.05, o + 0.05)
      })
      .collect();
    let scores: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
    let keep = non_max_suppression(&b, &scores, 0.5, 3);
    assert_eq!(keep, vec![9, 8, 7]);
  }

  #[test]
  fn output_properties_hold() {
    let b = boxes();
    let scores = [0.3, 0.9, 0.3, 0.8, 0.1];
    let threshold = 0.4;
    let keep = non_max_suppression(&b, &scores, threshold, 4);
    assert!(keep.len() <= 4);
    for w in keep.windows(2) {
      assert!(scores[w[0]] >= scores[w[1]]);
    }
    for (i, &a) in keep.iter().enumerate() {
      assert!(a < b.len());
      for &c in &keep[i + 1..] {
        assert!(b[a].iou(&b[c]) <= threshold);
      }
    }
  }

  #[test]
  fn threshold_is_strictly_greater() {
    // IoU 恰为 1/3
    let b = [BBox::new(0.0, 0.0, 1.0, 1.0), BBox::new(0.0, 0.5, 1.0, 1.5)];
    let iou = b[0].iou(&b[1]);
    assert_eq!(non_max_suppression(&b, &[0.9, 0.8], iou, 10), vec![0, 1]);
  }
}
