use std::path::Path;

use opencv::Result;
use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d::SIFT;
use opencv::prelude::*;

use crate::config::SiftOptions;
use crate::utils;

/// SIFT 描述符维度
pub const DESCRIPTOR_DIM: usize = 128;

/// 单个局部特征点的描述符
pub type Descriptor = [f32; DESCRIPTOR_DIM];

/// SIFT 特征提取器
///
/// 内部持有 OpenCV 对象，不能跨线程共享，需要并行时每个线程各自创建一个。
pub struct SiftExtractor {
    sift: Ptr<SIFT>,
    opts: SiftOptions,
}

impl SiftExtractor {
    pub fn create(opts: SiftOptions) -> Result<Self> {
        let mut sift = SIFT::create_def()?;
        if opts.max_keypoints > 0 {
            sift.set_n_features(opts.max_keypoints)?;
        }
        Ok(Self { sift, opts })
    }

    /// 提取灰度图片的特征点与描述符
    ///
    /// 纯色等没有特征点的图片会返回空列表，而不是错误。
    pub fn detect(&mut self, image: &Mat) -> Result<(Vector<KeyPoint>, Vec<Descriptor>)> {
        let mask = Mat::default();
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut des = Mat::default();
        self.sift.detect_and_compute(image, &mask, &mut keypoints, &mut des, false)?;
        if des.rows() == 0 {
            return Ok((keypoints, vec![]));
        }
        let (rows, _) = des.data_typed::<f32>()?.as_chunks::<DESCRIPTOR_DIM>();
        Ok((keypoints, rows.to_vec()))
    }

    /// 读取文件并提取描述符，文件无法解码时返回 `None`
    pub fn detect_file(&mut self, path: impl AsRef<Path>) -> Result<Option<Vec<Descriptor>>> {
        let Some(image) = utils::imread(path, self.opts.max_side)? else {
            return Ok(None);
        };
        let (_, des) = self.detect(&image)?;
        Ok(Some(des))
    }
}
