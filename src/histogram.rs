//! 词袋直方图编码
//!
//! 训练与识别必须经过完全相同的 `encode` + `normalize` 流程。

use crate::codebook::Codebook;
use crate::sift::Descriptor;

/// 统计每个描述符最近的视觉单词，返回长度为 k 的频数直方图
///
/// 没有描述符时返回全零向量。
pub fn encode(descriptors: &[Descriptor], codebook: &Codebook) -> Vec<f32> {
    let mut hist = vec![0.0; codebook.k()];
    for word in codebook.assign_all(descriptors) {
        hist[word] += 1.0;
    }
    hist
}

/// L2 归一化，零向量保持不变
pub fn normalize(mut hist: Vec<f32>) -> Vec<f32> {
    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        hist.iter_mut().for_each(|v| *v /= norm);
    }
    hist
}

/// `encode` 与 `normalize` 的组合
pub fn bag_of_words(descriptors: &[Descriptor], codebook: &Codebook) -> Vec<f32> {
    normalize(encode(descriptors, codebook))
}
