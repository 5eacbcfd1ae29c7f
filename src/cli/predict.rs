use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{LearnOptions, Opts, SiftOptions, TrainOptions};
use crate::engine::Engine;
use crate::predictor::Verdict;
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct PredictCommand {
    /// 领域名称
    pub domain: String,
    /// 图片路径，可以有多张
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// 置信度阈值，低于该值时输出 Unknown
    #[arg(short, long, default_value_t = 0.35)]
    pub threshold: f64,
}

impl SubCommandExtend for PredictCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let domain = utils::normalize_name(&self.domain)
            .ok_or_else(|| anyhow!("非法的领域名称: {:?}", self.domain))?;
        // 特征提取参数随模型一起保存，这里使用默认值即可
        let engine = Engine::open(
            opts.data_dir.clone(),
            SiftOptions::default(),
            TrainOptions::default(),
            LearnOptions::default(),
            false,
        )?;

        for path in &self.images {
            let bytes = tokio::fs::read(path).await?;
            match engine.predictor.classify(&bytes, &domain) {
                Ok(recognition) => {
                    let verdict = Verdict::new(recognition, self.threshold);
                    println!("{}\t{}\t{:.4}", path.display(), verdict.label, verdict.confidence);
                }
                Err(e) => println!("{}\terror\t{e}", path.display()),
            }
        }
        Ok(())
    }
}
