// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stage/detection.rs - 检测层
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

use std::collections::BTreeMap;

use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use tracing::debug;

use crate::{
  geometry::{BBox, Delta},
  nms::non_max_suppression,
  stage::StageError,
};

/// 背景类下标
pub const BACKGROUND_CLASS: usize = 0;

/// 检测层参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
  /// 含背景类
  pub num_classes: usize,
  pub max_detections: usize,
  pub bbox_std_dev: [f32; 4],
  /// 置信度 `>=` 该值才保留
  pub min_confidence: f32,
  pub nms_threshold: f32,
}

/// 单个检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub bbox: BBox,
  pub class_id: usize,
  pub score: f32,
}

impl Detection {
  /// 输出张量每行的宽度 `(y1, x1, y2, x2, class_id, score)`
  pub const ROW: usize = 6;

  pub fn to_row(&self) -> [f32; 6] {
    let [y1, x1, y2, x2] = self.bbox.to_array();
    [y1, x1, y2, x2, self.class_id as f32, self.score]
  }

  /// 从输出行解析，填充行返回 `None`
  pub fn from_row(row: ArrayView1<f32>) -> Option<Detection> {
    if row.len() < Self::ROW || row.iter().all(|&v| v == 0.0) {
      return None;
    }
    Some(Detection {
      bbox: BBox::new(row[0], row[1], row[2], row[3]),
      class_id: row[4].round() as usize,
      score: row[5],
    })
  }
}

/// 检测层
///
/// 每个候选框取最可能的类别，依次经过置信度门限、逐类 NMS 和全局截断，
/// 输出 `[batch, max_detections, 6]`，不足部分以全零行填充。
#[derive(Debug, Clone)]
pub struct DetectionLayer {
  params: DetectionParams,
}

impl DetectionLayer {
  pub fn new(params: DetectionParams) -> Self {
    DetectionLayer { params }
  }

  pub fn params(&self) -> &DetectionParams {
    &self.params
  }

  /// 单张图像：`rois [R, 4]`，`probs [R, C]`，`deltas [R, C * 4]`
  pub fn detect(
    &self,
    rois: ArrayView2<f32>,
    probs: ArrayView2<f32>,
    deltas: ArrayView2<f32>,
    window: &BBox,
  ) -> Result<Vec<Detection>, StageError> {
    let p = &self.params;
    let (regions, classes) = (rois.nrows(), p.num_classes);
    if rois.ncols() != 4 {
      return Err(StageError::shape("rois", &[regions, 4], rois.shape()));
    }
    if probs.shape() != [regions, classes] {
      return Err(StageError::shape("class probs", &[regions, classes], probs.shape()));
    }
    if deltas.shape() != [regions, classes * 4] {
      return Err(StageError::shape(
        "class deltas",
        &[regions, classes * 4],
        deltas.shape(),
      ));
    }

    let rows = rois
      .rows()
      .into_iter()
      .zip(probs.rows())
      .zip(deltas.rows());
    let mut candidates = Vec::new();
    for ((roi, class_probs), class_deltas) in rows {
      let roi = BBox::new(roi[0], roi[1], roi[2], roi[3]);
      if roi.is_padding() {
        continue;
      }

      // 同分时类别下标小者胜出，因此与背景同分也视为背景
      let (class_id, score) = class_probs.iter().copied().enumerate().fold(
        (BACKGROUND_CLASS, f32::NEG_INFINITY),
        |best, (c, s)| if s > best.1 { (c, s) } else { best },
      );
      if class_id == BACKGROUND_CLASS || score < p.min_confidence {
        continue;
      }

      let offset = class_id * 4;
      let delta = Delta::new(
        class_deltas[offset],
        class_deltas[offset + 1],
        class_deltas[offset + 2],
        class_deltas[offset + 3],
      );
      let bbox = roi.apply_delta(&delta.scale(&p.bbox_std_dev)).clip(window);
      candidates.push(Detection {
        bbox,
        class_id,
        score,
      });
    }

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, det) in candidates.iter().enumerate() {
      by_class.entry(det.class_id).or_default().push(i);
    }

    let mut kept = Vec::new();
    for indices in by_class.values() {
      let boxes: Vec<BBox> = indices.iter().map(|&i| candidates[i].bbox).collect();
      let scores: Vec<f32> = indices.iter().map(|&i| candidates[i].score).collect();
      let keep = non_max_suppression(&boxes, &scores, p.nms_threshold, p.max_detections);
      kept.extend(keep.into_iter().map(|k| candidates[indices[k]]));
    }

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(p.max_detections);
    debug!(
      "检测: 门限后 {} 个, 类别 {} 个, 最终 {} 个",
      candidates.len(),
      by_class.len(),
      kept.len()
    );
    Ok(kept)
  }

  /// 批量处理，`windows [B, 4]` 为每张图像的有效区域
  pub fn forward(
    &self,
    rois: ArrayView3<f32>,
    probs: ArrayView3<f32>,
    deltas: ArrayView3<f32>,
    windows: ArrayView2<f32>,
  ) -> Result<Array3<f32>, StageError> {
    let (batch, regions) = (rois.shape()[0], rois.shape()[1]);
    let classes = self.params.num_classes;
    if rois.shape()[2] != 4 {
      return Err(StageError::shape("rois", &[batch, regions, 4], rois.shape()));
    }
    if probs.shape() != [batch, regions, classes] {
      return Err(StageError::shape(
        "class probs",
        &[batch, regions, classes],
        probs.shape(),
      ));
    }
    if deltas.shape() != [batch, regions, classes * 4] {
      return Err(StageError::shape(
        "class deltas",
        &[batch, regions, classes * 4],
        deltas.shape(),
      ));
    }
    if windows.shape() != [batch, 4] {
      return Err(StageError::shape("windows", &[batch, 4], windows.shape()));
    }

    let mut output = Array3::<f32>::zeros((batch, self.params.max_detections, Detection::ROW));
    for (image, mut rows) in output.axis_iter_mut(Axis(0)).enumerate() {
      let w = windows.row(image);
      let window = BBox::new(w[0], w[1], w[2], w[3]);
      let detections = self.detect(
        rois.index_axis(Axis(0), image),
        probs.index_axis(Axis(0), image),
        deltas.index_axis(Axis(0), image),
        &window,
      )?;
      for (mut row, det) in rows.rows_mut().into_iter().zip(detections) {
        row.assign(&ndarray::aview1(&det.to_row()));
      }
    }

    Ok(output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array2, array};

  fn layer(num_classes: usize, max_detections: usize) -> DetectionLayer {
    DetectionLayer::new(DetectionParams {
      num_classes,
      max_detections,
      bbox_std_dev: [0.1, 0.1, 0.2, 0.2],
      min_confidence: 0.5,
      nms_threshold: 0.3,
    })
  }

  fn unit_windows(batch: usize) -> Array2<f32> {
    Array2::from_shape_fn((batch, 4), |(_, j)| if j >= 2 { 1.0 } else { 0.0 })
  }

  #[test]
  fn identical_boxes_keep_higher_confidence() {
    let rois = array![[[0.1, 0.1, 0.4, 0.4], [0.1, 0.1, 0.4, 0.4], [0.0, 0.0, 0.0, 0.0]]];
    let probs = array![[[0.0, 0.9, 0.1], [0.0, 0.85, 0.15], [0.0, 0.0, 0.0]]];
    let deltas = Array3::<f32>::zeros((1, 3, 12));
    let out = layer(3, 4)
      .forward(rois.view(), probs.view(), deltas.view(), unit_windows(1).view())
      .unwrap();

    assert_eq!(out.shape(), &[1, 4, 6]);
    let first = out.index_axis(Axis(0), 0);
    let row0 = first.row(0);
    let expected = [0.1, 0.1, 0.4, 0.4, 1.0, 0.9];
    for (g, e) in row0.iter().zip(expected) {
      assert!((g - e).abs() < 1e-6);
    }
    assert!(first.rows().into_iter().skip(1).all(|r| r.iter().all(|&v| v == 0.0)));
  }

  #[test]
  fn confidence_gate_is_inclusive() {
    let rois = array![[0.1, 0.1, 0.4, 0.4], [0.5, 0.5, 0.9, 0.9]];
    let probs = array![[0.5, 0.5, 0.0], [0.0, 0.5, 0.5]];
    let deltas = Array2::<f32>::zeros((2, 12));
    let dets = layer(3, 10)
      .detect(rois.view(), probs.view(), deltas.view(), &BBox::UNIT)
      .unwrap();
    // 第一行与背景同分，视为背景；第二行取类别 1，恰好等于门限
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class_id, 1);
    assert_eq!(dets[0].score, 0.5);
  }

  #[test]
  fn background_and_low_confidence_dropped() {
    let rois = array![[0.1, 0.1, 0.4, 0.4], [0.5, 0.5, 0.9, 0.9]];
    let probs = array![[0.8, 0.1, 0.1], [0.2, 0.45, 0.35]];
    let deltas = Array2::<f32>::zeros((2, 12));
    let dets = layer(3, 10)
      .detect(rois.view(), probs.view(), deltas.view(), &BBox::UNIT)
      .unwrap();
    assert!(dets.is_empty());
  }

  #[test]
  fn uses_selected_class_delta_and_clips_to_window() {
    let rois = array![[0.2, 0.2, 0.6, 0.6]];
    let probs = array![[0.0, 0.1, 0.9]];
    // 类别 1 的回归量是干扰项，类别 2 把中心向下移 0.1 个高度 (0.1 / std 0.1 = 1.0)
    let deltas = array![[0.0, 0.0, 0.0, 0.0, 9.0, 9.0, 9.0, 9.0, 1.0, 0.0, 0.0, 0.0]];
    let window = BBox::new(0.0, 0.0, 0.6, 1.0);
    let dets = layer(3, 10)
      .detect(rois.view(), probs.view(), deltas.view(), &window)
      .unwrap();
    assert_eq!(dets.len(), 1);
    let b = dets[0].bbox;
    assert!((b.y1 - 0.24).abs() < 1e-6);
    assert!((b.y2 - 0.6).abs() < 1e-6);
    assert!((b.x1 - 0.2).abs() < 1e-6 && (b.x2 - 0.6).abs() < 1e-6);
  }

  #[test]
  fn classes_are_suppressed_independently() {
    let rois = array![
      [0.1, 0.1, 0.5, 0.5],
      [0.1, 0.1, 0.5, 0.5],
      [0.12, 0.1, 0.5, 0.5],
      [0.6, 0.6, 0.9, 0.9]
    ];
    let probs = array![
      [0.0, 0.9, 0.1],
      [0.0, 0.2, 0.8],
      [0.0, 0.7, 0.3],
      [0.1, 0.6, 0.3]
    ];
    let deltas = Array2::<f32>::zeros((4, 12));
    let dets = layer(3, 10)
      .detect(rois.view(), probs.view(), deltas.view(), &BBox::UNIT)
      .unwrap();
    let summary: Vec<(usize, f32)> = dets.iter().map(|d| (d.class_id, d.score)).collect();
    assert_eq!(summary, vec![(1, 0.9), (2, 0.8), (1, 0.6)]);

    for (i, a) in dets.iter().enumerate() {
      assert!(a.score >= 0.5);
      for b in &dets[i + 1..] {
        if a.class_id == b.class_id {
          assert!(a.bbox.iou(&b.bbox) <= 0.3);
        }
      }
    }
  }

  #[test]
  fn global_cap_truncates_by_confidence() {
    let rois = array![
      [0.0, 0.0, 0.1, 0.1],
      [0.2, 0.2, 0.3, 0.3],
      [0.4, 0.4, 0.5, 0.5]
    ];
    let probs = array![[0.0, 0.6, 0.0], [0.0, 0.0, 0.95], [0.0, 0.7, 0.0]];
    let deltas = Array2::<f32>::zeros((3, 12));
    let dets = layer(3, 2)
      .detect(rois.view(), probs.view(), deltas.view(), &BBox::UNIT)
      .unwrap();
    let scores: Vec<f32> = dets.iter().map(|d| d.score).collect();
    assert_eq!(scores, vec![0.95, 0.7]);
  }

  #[test]
  fn delta_width_mismatch_is_fatal() {
    let rois = Array3::<f32>::zeros((1, 2, 4));
    let probs = Array3::<f32>::zeros((1, 2, 3));
    let deltas = Array3::<f32>::zeros((1, 2, 8));
    let err = layer(3, 4)
      .forward(rois.view(), probs.view(), deltas.view(), unit_windows(1).view())
      .unwrap_err();
    assert!(matches!(err, StageError::ShapeMismatch { what: "class deltas", .. }));
  }

  #[test]
  fn single_image_shapes_are_checked() {
    let rois = array![[0.1, 0.1, 0.4, 0.4]];
    let probs = array![[0.0, 0.9, 0.1]];
    let narrow = Array2::<f32>::zeros((1, 8));
    assert!(matches!(
      layer(3, 4).detect(rois.view(), probs.view(), narrow.view(), &BBox::UNIT),
      Err(StageError::ShapeMismatch { what: "class deltas", .. })
    ));

    let wide = array![[0.0, 0.9, 0.1, 0.0]];
    let deltas = Array2::<f32>::zeros((1, 16));
    assert!(matches!(
      layer(3, 4).detect(rois.view(), wide.view(), deltas.view(), &BBox::UNIT),
      Err(StageError::ShapeMismatch { what: "class probs", .. })
    ));
  }

  #[test]
  fn all_padding_input_gives_all_padding_output() {
    let rois = Array3::<f32>::zeros((2, 5, 4));
    let probs = Array3::<f32>::from_elem((2, 5, 3), 0.9);
    let deltas = Array3::<f32>::zeros((2, 5, 12));
    let out = layer(3, 4)
      .forward(rois.view(), probs.view(), deltas.view(), unit_windows(2).view())
      .unwrap();
    assert_eq!(out.shape(), &[2, 4, 6]);
    assert!(out.iter().all(|&v| v == 0.0));
  }

  #[test]
  fn row_round_trip_and_padding() {
    let det = Detection {
      bbox: BBox::new(0.1, 0.2, 0.3, 0.4),
      class_id: 7,
      score: 0.75,
    };
    let row = det.to_row();
    assert_eq!(Detection::from_row(ndarray::aview1(&row)), Some(det));
    assert_eq!(Detection::from_row(ndarray::aview1(&[0.0; 6])), None);
  }
}
