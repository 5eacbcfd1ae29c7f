use anyhow::{Result, anyhow};
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{LearnOptions, Opts, SiftOptions, TrainOptions};
use crate::engine::Engine;
use crate::trainer::SubmitOutcome;
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct TrainCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    /// 领域名称
    pub domain: String,
}

impl SubCommandExtend for TrainCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let domain = utils::normalize_name(&self.domain)
            .ok_or_else(|| anyhow!("非法的领域名称: {:?}", self.domain))?;
        let engine = Engine::open(
            opts.data_dir.clone(),
            self.sift.clone(),
            self.train.clone(),
            LearnOptions::default(),
            true,
        )?;

        let SubmitOutcome::Started(handle) = engine.trainer.submit(&domain) else {
            return Err(anyhow!("已有训练任务在进行"));
        };
        let report = handle.wait().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
