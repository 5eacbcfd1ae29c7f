use std::path::Path;

use indicatif::ProgressStyle;
use opencv::core::{self, KeyPoint, Mat, Vector};
use opencv::prelude::*;
use opencv::{features2d, imgcodecs, imgproc};

/// 从内存中解码灰度图片，并把最长边限制在 `max_side` 以内
///
/// 无法解码时返回 `None`，OpenCV 本身的错误仍然上抛。
pub fn imdecode(bytes: &[u8], max_side: i32) -> opencv::Result<Option<Mat>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let mat = Mat::from_slice(bytes)?;
    let img = imgcodecs::imdecode(&mat, imgcodecs::IMREAD_GRAYSCALE)?;
    if img.empty() {
        return Ok(None);
    }
    adjust_image_size(img, max_side).map(Some)
}

/// 从文件读取灰度图片，并把最长边限制在 `max_side` 以内
pub fn imread(path: impl AsRef<Path>, max_side: i32) -> opencv::Result<Option<Mat>> {
    let path = path.as_ref().to_string_lossy();
    let img = imgcodecs::imread(&path, imgcodecs::IMREAD_GRAYSCALE)?;
    if img.empty() {
        return Ok(None);
    }
    adjust_image_size(img, max_side).map(Some)
}

pub fn imwrite(path: impl AsRef<Path>, img: &impl core::ToInputArray) -> opencv::Result<bool> {
    let flags = Vector::<i32>::new();
    imgcodecs::imwrite(&path.as_ref().to_string_lossy(), img, &flags)
}

/// 编码为 PNG，主要用于测试和生成样本
pub fn imencode_png(img: &impl core::ToInputArray) -> opencv::Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let flags = Vector::<i32>::new();
    imgcodecs::imencode(".png", img, &mut buf, &flags)?;
    Ok(buf.to_vec())
}

/// 如果最长边超过 `max_side`，则等比缩小
pub fn adjust_image_size(img: Mat, max_side: i32) -> opencv::Result<Mat> {
    let longest = img.cols().max(img.rows());
    if max_side <= 0 || longest <= max_side {
        return Ok(img);
    }
    let scale = max_side as f64 / longest as f64;
    let mut output = Mat::default();
    imgproc::resize(
        &img,
        &mut output,
        core::Size::default(),
        scale,
        scale,
        imgproc::InterpolationFlags::INTER_AREA as i32,
    )?;
    Ok(output)
}

pub fn draw_keypoints(
    image: &impl core::ToInputArray,
    keypoints: &Vector<KeyPoint>,
) -> opencv::Result<Mat> {
    let mut output = Mat::default();
    features2d::draw_keypoints(
        image,
        keypoints,
        &mut output,
        core::Scalar::all(-1.0),
        features2d::DrawMatchesFlags::DRAW_RICH_KEYPOINTS,
    )?;
    Ok(output)
}

/// 根据文件头判断图片格式，仅接受 JPEG 与 PNG
pub fn image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xff, 0xd8]) {
        Some("jpg")
    } else if bytes.starts_with(b"\x89PNG") {
        Some("png")
    } else {
        None
    }
}

/// 规范化领域名或标签名，使其可以安全地作为目录名
///
/// 去掉首尾空白、转为小写、内部空白替换为 `_`，非法名称返回 `None`。
pub fn normalize_name(name: &str) -> Option<String> {
    let name = name.split_whitespace().collect::<Vec<_>>().join("_").to_lowercase();
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':'));
    valid.then_some(name)
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
