use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{LearnOptions, Opts, SiftOptions, TrainOptions};
use crate::engine::Engine;
use crate::learner::Feedback;
use crate::trainer::SubmitOutcome;

#[derive(Parser, Debug, Clone)]
pub struct FeedbackCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    #[command(flatten)]
    pub learn: LearnOptions,
    /// 领域名称
    pub domain: String,
    /// 图片路径
    pub image: PathBuf,
    /// 图片的标签
    pub label: String,
    /// 标签是模型给出的错误结果，正确名称由 --new-name 指定
    #[arg(long)]
    pub wrong: bool,
    /// 正确的品牌名称，可以是新品牌
    #[arg(long, value_name = "NAME")]
    pub new_name: Option<String>,
}

impl SubCommandExtend for FeedbackCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let engine = Engine::open(
            opts.data_dir.clone(),
            self.sift.clone(),
            self.train.clone(),
            self.learn.clone(),
            true,
        )?;

        let feedback = Feedback {
            domain: self.domain.clone(),
            image: tokio::fs::read(&self.image).await?,
            label: self.label.clone(),
            is_correct: !self.wrong,
            new_name: self.new_name.clone(),
        };
        let (ack, follow_up) = engine.learner.receive(feedback)?;
        println!("{}: {}/{} ({} 个样本)", ack.status(), ack.domain, ack.label, ack.samples);

        let follow_up = follow_up.await?;
        if let Some(expansion) = &follow_up.expansion {
            info!("扩充结果: {}", serde_json::to_string(expansion)?);
        }
        match follow_up.submission {
            SubmitOutcome::Started(handle) => {
                let report = handle.wait().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            SubmitOutcome::Busy => println!("已有训练任务在进行，本次训练被推迟"),
        }
        Ok(())
    }
}
