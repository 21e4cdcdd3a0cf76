// 该文件是 Shanan （山南西风） 项目的一部分。
// src/results.rs - 流水线输出解码为逐图像检测结果
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

use ndarray::s;
use tracing::debug;

use crate::{
  geometry::BBox,
  model::{DetectItem, DetectResult, WithLabel},
  pipeline::PipelineOutput,
  stage::{Detection, StageError, select_masks},
};

/// 将归一化的检测框映射回原图像素坐标
///
/// `window` 为原图在模型输入中所占的归一化区域，`(height, width)` 为原图尺寸。
pub fn to_original_pixels(bbox: &BBox, window: &BBox, height: f32, width: f32) -> [f32; 4] {
  let (wh, ww) = (window.height(), window.width());
  if !(wh > 0.0) || !(ww > 0.0) {
    return [0.0; 4];
  }
  [
    (bbox.y1 - window.y1) / wh * height,
    (bbox.x1 - window.x1) / ww * width,
    (bbox.y2 - window.y1) / wh * height,
    (bbox.x2 - window.x1) / ww * width,
  ]
}

/// 按图像拆分流水线输出，跳过填充行
///
/// 有透传数据时使用其窗口与原始尺寸，否则以 `input_size` 作为原图尺寸、整幅图像作为窗口。
pub fn decode_results<T: WithLabel>(
  output: &PipelineOutput,
  input_size: (u32, u32),
) -> Result<Vec<DetectResult<T>>, StageError> {
  let masks = select_masks(output.detections.view(), output.masks.view())?;
  let batch = output.detections.shape()[0];

  let mut results = Vec::with_capacity(batch);
  for image in 0..batch {
    let (image_id, window, height, width) = match &output.passthrough {
      Some(p) => {
        let w = p.windows.row(image);
        let [h, w_px, _] = p.original_shapes[image];
        (
          Some(p.image_ids[image].clone()),
          BBox::new(w[0], w[1], w[2], w[3]),
          h as f32,
          w_px as f32,
        )
      }
      None => (
        None,
        BBox::UNIT,
        input_size.0 as f32,
        input_size.1 as f32,
      ),
    };

    let items: Vec<DetectItem<T>> = output
      .detections
      .slice(s![image, .., ..])
      .rows()
      .into_iter()
      .enumerate()
      .filter_map(|(slot, row)| Detection::from_row(row).map(|det| (slot, det)))
      .map(|(slot, det)| DetectItem {
        kind: T::from_label_id(det.class_id as u32),
        score: det.score,
        bbox: to_original_pixels(&det.bbox, &window, height, width),
        mask: masks.slice(s![image, slot, .., ..]).to_owned(),
      })
      .collect();

    debug!("图像 {} 解码得到 {} 个检测", image, items.len());
    results.push(DetectResult {
      image_id,
      items: items.into_boxed_slice(),
    });
  }

  Ok(results)
}
