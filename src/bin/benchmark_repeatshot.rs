// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理测速
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

use shanan_dl::{
  FromUrl,
  input::InputWrapper,
  model::JsonModelBuilder,
  output::OutputWrapper,
  task::{RepeatShotTask, Task},
};
use tracing::info;

/// 重复推理测速参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// JSON 模型描述文件
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 重复次数
  #[arg(long, default_value_t = 1000)]
  pub repeat: usize,
  /// 使用 8 位量化
  #[arg(long)]
  pub int8: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型描述路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let builder = JsonModelBuilder::from_url(&args.model)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let task = RepeatShotTask::default().with_repeat_times(args.repeat);

  if args.int8 {
    let model = builder.build::<i8>()?;
    let output = output.labels(model.model().label_names().to_vec());
    task.run_task(input.into_iter(), model, output)?;
  } else {
    let model = builder.build::<i16>()?;
    let output = output.labels(model.model().label_names().to_vec());
    task.run_task(input.into_iter(), model, output)?;
  }

  Ok(())
}
