// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stage/mask.rs - 掩码选择与还原
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

use ndarray::{Array2, Array4, ArrayView2, ArrayView3, ArrayView5, s};

use crate::stage::{Detection, StageError};

/// 从 `masks [B, D, C, mh, mw]` 中为每个检测取出其类别对应的网格
///
/// 返回 `[B, D, mh, mw]`，填充行对应全零网格。
pub fn select_masks(
  detections: ArrayView3<f32>,
  masks: ArrayView5<f32>,
) -> Result<Array4<f32>, StageError> {
  let (batch, slots) = (detections.shape()[0], detections.shape()[1]);
  let (mb, md, classes, mh, mw) = masks.dim();
  if detections.shape()[2] != Detection::ROW {
    return Err(StageError::shape(
      "detections",
      &[batch, slots, Detection::ROW],
      detections.shape(),
    ));
  }
  if mb != batch || md != slots {
    return Err(StageError::shape(
      "masks",
      &[batch, slots, classes, mh, mw],
      masks.shape(),
    ));
  }

  let mut selected = Array4::<f32>::zeros((batch, slots, mh, mw));
  for image in 0..batch {
    for slot in 0..slots {
      let Some(det) = Detection::from_row(detections.slice(s![image, slot, ..])) else {
        continue;
      };
      if det.class_id >= classes {
        return Err(StageError::shape(
          "mask classes",
          &[det.class_id + 1],
          &[classes],
        ));
      }
      selected
        .slice_mut(s![image, slot, .., ..])
        .assign(&masks.slice(s![image, slot, det.class_id, .., ..]));
    }
  }

  Ok(selected)
}

/// 将检测框内的掩码网格双线性采样回整幅图像并二值化
///
/// `bbox` 为像素坐标 `(y1, x1, y2, x2)`，输出 `[image_height, image_width]`。
pub fn unmold_mask(
  mask: ArrayView2<f32>,
  bbox: [f32; 4],
  image_height: usize,
  image_width: usize,
  threshold: f32,
) -> Array2<bool> {
  let mut full = Array2::from_elem((image_height, image_width), false);
  let (mh, mw) = mask.dim();
  let [y1, x1, y2, x2] = bbox;
  let (box_h, box_w) = (y2 - y1, x2 - x1);
  if mh == 0 || mw == 0 || !(box_h > 0.0) || !(box_w > 0.0) {
    return full;
  }

  let row_range = pixel_range(y1, y2, image_height);
  let col_range = pixel_range(x1, x2, image_width);
  for py in row_range {
    // 像素中心映射到网格坐标
    let gy = ((py as f32 + 0.5 - y1) / box_h * mh as f32 - 0.5).clamp(0.0, (mh - 1) as f32);
    for px in col_range.clone() {
      let gx = ((px as f32 + 0.5 - x1) / box_w * mw as f32 - 0.5).clamp(0.0, (mw - 1) as f32);
      full[[py, px]] = bilinear(&mask, gy, gx) >= threshold;
    }
  }

  full
}

fn pixel_range(lo: f32, hi: f32, limit: usize) -> std::ops::Range<usize> {
  let start = (lo.round().max(0.0) as usize).min(limit);
  let end = (hi.round().max(0.0) as usize).min(limit);
  start..end.max(start)
}

fn bilinear(grid: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
  let (h, w) = grid.dim();
  let (y0, x0) = (y.floor() as usize, x.floor() as usize);
  let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
  let (fy, fx) = (y - y0 as f32, x - x0 as f32);
  let top = grid[[y0, x0]] * (1.0 - fx) + grid[[y0, x1]] * fx;
  let bottom = grid[[y1, x0]] * (1.0 - fx) + grid[[y1, x1]] * fx;
  top * (1.0 - fy) + bottom * fy
}

/// 掩码二值化默认阈值
pub const DEFAULT_MASK_THRESHOLD: f32 = 0.5;

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array3, Array5};

  #[test]
  fn selects_grid_of_detected_class() {
    let mut detections = Array3::<f32>::zeros((1, 3, 6));
    detections
      .slice_mut(s![0, 0, ..])
      .assign(&ndarray::aview1(&[0.1, 0.1, 0.5, 0.5, 2.0, 0.9]));
    detections
      .slice_mut(s![0, 1, ..])
      .assign(&ndarray::aview1(&[0.5, 0.5, 0.9, 0.9, 1.0, 0.8]));
    let masks = Array5::from_shape_fn((1, 3, 3, 2, 2), |(_, d, c, _, _)| (d * 10 + c) as f32);

    let selected = select_masks(detections.view(), masks.view()).unwrap();
    assert_eq!(selected.shape(), &[1, 3, 2, 2]);
    assert!(selected.slice(s![0, 0, .., ..]).iter().all(|&v| v == 2.0));
    assert!(selected.slice(s![0, 1, .., ..]).iter().all(|&v| v == 11.0));
    assert!(selected.slice(s![0, 2, .., ..]).iter().all(|&v| v == 0.0));
  }

  #[test]
  fn mismatched_slots_rejected() {
    let detections = Array3::<f32>::zeros((1, 3, 6));
    let masks = Array5::<f32>::zeros((1, 2, 3, 2, 2));
    assert!(select_masks(detections.view(), masks.view()).is_err());
  }

  #[test]
  fn unmold_fills_only_inside_box() {
    let mask = Array2::from_elem((4, 4), 1.0f32);
    let full = unmold_mask(mask.view(), [2.0, 3.0, 6.0, 8.0], 10, 10, DEFAULT_MASK_THRESHOLD);
    assert_eq!(full.iter().filter(|&&v| v).count(), 4 * 5);
    assert!(full[[2, 3]] && full[[5, 7]]);
    assert!(!full[[1, 3]] && !full[[6, 3]] && !full[[2, 8]]);
  }

  #[test]
  fn unmold_thresholds_and_clips() {
    // 左半为 0，右半为 1
    let mask = Array2::from_shape_fn((2, 2), |(_, x)| x as f32);
    let full = unmold_mask(mask.view(), [0.0, -4.0, 4.0, 4.0], 4, 4, DEFAULT_MASK_THRESHOLD);
    // 框横跨 [-4, 4)，图像内只剩右半
    assert!(full.iter().all(|&v| v));

    let empty = unmold_mask(mask.view(), [2.0, 2.0, 2.0, 3.0], 4, 4, DEFAULT_MASK_THRESHOLD);
    assert!(empty.iter().all(|&v| !v));
  }
}
