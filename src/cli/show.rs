use anyhow::{Result, anyhow};
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, SiftOptions};
use crate::sift::SiftExtractor;
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    #[command(flatten)]
    pub sift: SiftOptions,
    /// 图片路径
    pub image: String,
    /// 绘制结果的保存路径
    pub output: String,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let image = utils::imread(&self.image, self.sift.max_side)?
            .ok_or_else(|| anyhow!("无法读取图片: {}", self.image))?;

        let mut sift = SiftExtractor::create(self.sift.clone())?;
        let (kps, _) = sift.detect(&image)?;
        let output = utils::draw_keypoints(&image, &kps)?;
        utils::imwrite(&self.output, &output)?;
        println!("{} 个特征点", kps.len());
        Ok(())
    }
}
