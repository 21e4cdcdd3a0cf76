// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/replay_oneshot.rs - 回放记录并执行一次推理
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_rcnn::{
  FromUrl,
  model::CocoLabel,
  output::LogRender,
  pipeline::PipelineBuilder,
  replay::{RecordedHeads, Recording},
  task::{OneShotTask, Task},
};
use tracing::info;

/// Shanan 两阶段检测回放参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件，例如 file:///path/config.json?environment=estimator
  #[arg(long, value_name = "CONFIG")]
  pub config: Url,
  /// 网络头输出记录，例如 replay:///path/record.json
  #[arg(long, value_name = "RECORD")]
  pub record: Url,
  /// 输出
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("配置文件: {}", args.config);
  info!("回放记录: {}", args.record);
  info!("输出: {}", args.output);

  let builder = PipelineBuilder::from_url(&args.config)?;
  let recording = Recording::from_url(&args.record)?;
  let heads = RecordedHeads::new(&recording, builder.config())?;
  let model = builder.build(heads.clone(), heads.clone(), heads.clone(), heads)?;
  let input = recording.input(model.config(), model.environment())?;
  let output: LogRender<CocoLabel> = LogRender::from_url(&args.output)?;

  OneShotTask.run_task(std::iter::once(input), model, output)?;

  Ok(())
}
