use anyhow::{Result, anyhow};
use clap::Parser;
use log::info;
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::cli::SubCommandExtend;
use crate::config::{LearnOptions, Opts, SiftOptions, TrainOptions};
use crate::engine::Engine;
use crate::pipeline::{FittedModel, fit_model};
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct TuneCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    #[command(flatten)]
    pub train: TrainOptions,
    /// 领域名称
    pub domain: String,
    /// 候选的词典大小，用逗号分隔
    #[arg(long, value_delimiter = ',', default_value = "50,100,200,500")]
    pub ks: Vec<usize>,
    /// 发布留出集准确率最高的模型
    #[arg(long)]
    pub publish: bool,
}

#[derive(Debug, Serialize)]
struct Trial {
    k: usize,
    /// 实际使用的词典大小，描述符不足时会变小
    effective_k: usize,
    accuracy: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Hyperparams {
    domain: String,
    best_k: usize,
    best_accuracy: Option<f64>,
    trials: Vec<Trial>,
}

impl SubCommandExtend for TuneCommand {
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

        let cmd = self.clone();
        let (trials, best) = spawn_blocking({
            let domain = domain.clone();
            let trainer = engine.trainer.clone();
            move || -> Result<(Vec<Trial>, FittedModel)> {
                // 特征只提取一次，每个 k 复用
                let dataset = trainer.task().dataset(&domain)?;
                let mut trials = vec![];
                let mut best: Option<FittedModel> = None;
                for &k in &cmd.ks {
                    let train = TrainOptions { k, ..cmd.train.clone() };
                    let model = fit_model(&dataset, &cmd.sift, &train)?;
                    let accuracy = model.metrics.evaluation.accuracy;
                    info!("k = {k}，留出集准确率 {accuracy:?}");
                    trials.push(Trial { k, effective_k: model.metrics.k, accuracy });

                    let better = best.as_ref().is_none_or(|b| {
                        accuracy.unwrap_or(0.0) > b.metrics.evaluation.accuracy.unwrap_or(0.0)
                    });
                    if better {
                        best = Some(model);
                    }
                }
                let best = best.ok_or_else(|| anyhow!("没有指定任何候选的词典大小"))?;
                Ok((trials, best))
            }
        })
        .await??;

        let hyperparams = Hyperparams {
            domain: domain.clone(),
            best_k: best.metrics.k,
            best_accuracy: best.metrics.evaluation.accuracy,
            trials,
        };
        let path = engine.store.write_json(&domain, "hyperparams.json", &hyperparams)?;
        println!("{}", serde_json::to_string_pretty(&hyperparams)?);
        info!("结果已写入 {}", path.display());

        if self.publish {
            engine.trainer.task().publisher().publish(&best)?;
        }
        Ok(())
    }
}
