use anyhow::{Result, ensure};
use kmeans::{EuclideanDistance, KMeans, KMeansConfig, KMeansState};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::sift::{DESCRIPTOR_DIM, Descriptor};

fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 视觉词典：描述符空间的 k 个聚类中心
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codebook {
    k: usize,
    /// 按行存储的聚类中心，长度为 k * DESCRIPTOR_DIM
    centroids: Vec<f32>,
}

impl Codebook {
    /// 直接使用给定的聚类中心构建词典
    pub fn from_centroids(centroids: &[Descriptor]) -> Self {
        Self { k: centroids.len(), centroids: centroids.as_flattened().to_vec() }
    }

    /// 使用所有训练图片的描述符训练词典
    ///
    /// 描述符数量少于 `k` 时，词典大小会降为描述符数量。
    pub fn train(descriptors: &[Descriptor], k: usize, max_iter: usize) -> Result<Self> {
        let n = descriptors.len();
        ensure!(n > 0, "没有可用于训练词典的描述符");
        ensure!(k > 0, "词典大小必须大于 0");

        // 点数不超过聚类数时，每个点各自成为一个中心就是最优解
        if n <= k {
            if n < k {
                warn!("描述符数量 {n} 少于词典大小 {k}，词典大小调整为 {n}");
            }
            return Ok(Self::from_centroids(descriptors));
        }

        info!("对 {n} 个描述符进行聚类，中心点数量 = {k}");
        let x = descriptors.as_flattened();
        let km: KMeans<_, 16, _> = KMeans::new(x, n, DESCRIPTOR_DIM, EuclideanDistance);
        let conf = KMeansConfig::build()
            .init_done(&|_s: &KMeansState<f32>| debug!("KMeans 初始化完成"))
            .iteration_done(&|s: &KMeansState<f32>, nr: usize, new_distsum: f32| {
                debug!(
                    "第 {} 轮 - 不平衡度：{:.2} | 距离和变化：{:+.2}",
                    nr,
                    imbalance_factor(&s.centroid_frequency),
                    new_distsum - s.distsum
                );
            })
            .build();
        // NOTE: init_kmeanplusplus 会 panic，这里沿用随机划分初始化
        let result = km.kmeans_lloyd(k, max_iter, KMeans::init_random_partition, &conf);
        let mut centroids = result.centroids.to_vec();
        centroids.truncate(k * DESCRIPTOR_DIM);

        // 空簇的中心可能是 NaN，用对应序号的样本替换，保证分配结果有意义
        for (i, centroid) in centroids.chunks_exact_mut(DESCRIPTOR_DIM).enumerate() {
            if centroid.iter().any(|v| !v.is_finite()) {
                centroid.copy_from_slice(&descriptors[i * n / k]);
            }
        }

        Ok(Self { k, centroids })
    }

    /// 视觉单词数量
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centroids[i * DESCRIPTOR_DIM..(i + 1) * DESCRIPTOR_DIM]
    }

    /// 找到欧氏距离最近的聚类中心，距离相同时取序号最小者
    pub fn assign(&self, descriptor: &Descriptor) -> usize {
        let mut best = 0;
        let mut best_distance = f32::INFINITY;
        for (i, centroid) in self.centroids.chunks_exact(DESCRIPTOR_DIM).enumerate() {
            let distance = squared_distance(descriptor, centroid);
            if distance < best_distance {
                best_distance = distance;
                best = i;
            }
        }
        best
    }

    pub fn assign_all(&self, descriptors: &[Descriptor]) -> Vec<usize> {
        descriptors.par_iter().map(|d| self.assign(d)).collect()
    }

    /// 检查内部数据的一致性，用于反序列化之后
    pub fn validate(&self) -> Result<()> {
        ensure!(self.k > 0, "词典为空");
        ensure!(self.centroids.len() == self.k * DESCRIPTOR_DIM, "词典数据长度不正确");
        Ok(())
    }
}
