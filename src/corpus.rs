//! 原始样本库：`<root>/<domain>/<label>/<image>`

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use log::{debug, warn};
use rand::distr::{Alphanumeric, SampleString};
use regex::Regex;
use walkdir::WalkDir;

use crate::error::FeedbackError;
use crate::utils;

static RE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)^(jpe?g|png)$").expect("failed to build regex"));

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| RE_SUFFIX.is_match(&ext.to_string_lossy()))
}

/// 列出目录下的所有子目录名，目录不存在时返回空列表
fn sub_dirs(path: &Path) -> Result<Vec<String>> {
    if !path.is_dir() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() && !name.starts_with('.') {
            names.push(name.into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    pub fn label_dir(&self, domain: &str, label: &str) -> PathBuf {
        self.root.join(domain).join(label)
    }

    /// 样本库中已存在的领域
    pub fn domains(&self) -> Result<Vec<String>> {
        sub_dirs(&self.root)
    }

    /// 样本库中某个领域已存在的标签目录
    pub fn discover_labels(&self, domain: &str) -> Result<Vec<String>> {
        sub_dirs(&self.domain_dir(domain))
    }

    /// 预设标签与磁盘上已有标签的并集，按字典序排列
    pub fn labels(&self, domain: &str, seeds: &[String]) -> Result<Vec<String>> {
        let mut labels = seeds.iter().cloned().collect::<BTreeSet<_>>();
        labels.extend(self.discover_labels(domain)?);
        Ok(labels.into_iter().collect())
    }

    /// 某个标签下的所有图片文件，按路径排序
    pub fn images(&self, domain: &str, label: &str) -> Result<Vec<PathBuf>> {
        let dir = self.label_dir(domain, label);
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut images = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if is_image_file(entry.path()) => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    warn!("跳过无法访问的文件: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();
        images.sort();
        Ok(images)
    }

    pub fn count_samples(&self, domain: &str, label: &str) -> Result<usize> {
        Ok(self.images(domain, label)?.len())
    }

    /// 标签目录中所有图片的内容哈希
    pub fn content_hashes(&self, domain: &str, label: &str) -> Result<HashSet<blake3::Hash>> {
        self.images(domain, label)?
            .into_iter()
            .map(|path| -> Result<blake3::Hash> {
                let data = fs::read(&path)
                    .with_context(|| format!("读取样本失败: {}", path.display()))?;
                Ok(blake3::hash(&data))
            })
            .collect()
    }

    /// 把一张图片写入标签目录，文件名由内容哈希与随机后缀组成，保证并发写入互不覆盖
    ///
    /// 只接受 JPEG 与 PNG，扩展名由文件头决定。
    pub fn save_sample(
        &self,
        domain: &str,
        label: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, FeedbackError> {
        let ext = utils::image_extension(bytes)
            .ok_or_else(|| FeedbackError::Decode("仅支持 JPEG 与 PNG 格式".to_string()))?;
        let dir = self.label_dir(domain, label);
        fs::create_dir_all(&dir)?;

        let hash = blake3::hash(bytes).to_hex();
        let suffix = Alphanumeric.sample_string(&mut rand::rng(), 8);
        let path = dir.join(format!("{}_{}.{}", &hash[..16], suffix, ext));

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        debug!("保存样本: {}", path.display());
        Ok(path)
    }

    /// 标签目录中是否已有以该内容哈希命名的文件
    fn saved_with_hash(&self, domain: &str, label: &str, hash: &blake3::Hash) -> Result<bool> {
        let prefix = format!("{}_", &hash.to_hex()[..16]);
        Ok(self.images(domain, label)?.iter().any(|path| {
            path.file_name().and_then(|name| name.to_str()).is_some_and(|name| name.starts_with(&prefix))
        }))
    }

    /// 内容哈希不在 `known` 中时保存图片，并把哈希加入 `known`
    ///
    /// 写入前会再按文件名检查一次，以发现 `known` 建立之后其他扩充任务保存的同一张图片。
    /// 两次检查之间没有加锁，并发写入仍可能留下重复样本。
    pub fn add_unique(
        &self,
        domain: &str,
        label: &str,
        bytes: &[u8],
        known: &mut HashSet<blake3::Hash>,
    ) -> Result<Option<PathBuf>, FeedbackError> {
        let hash = blake3::hash(bytes);
        if known.contains(&hash) || self.saved_with_hash(domain, label, &hash)? {
            known.insert(hash);
            return Ok(None);
        }
        let path = self.save_sample(domain, label, bytes)?;
        known.insert(hash);
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";
    const JPG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3];

    #[test]
    fn save_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());

        let a = corpus.save_sample("cars", "lexus", PNG).unwrap();
        let b = corpus.save_sample("cars", "lexus", PNG).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "png");
        corpus.save_sample("cars", "mazda", JPG).unwrap();

        assert_eq!(corpus.count_samples("cars", "lexus").unwrap(), 2);
        assert_eq!(corpus.count_samples("cars", "mazda").unwrap(), 1);
        assert_eq!(corpus.count_samples("cars", "audi").unwrap(), 0);
        assert_eq!(corpus.domains().unwrap(), vec!["cars"]);
    }

    #[test]
    fn reject_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        let err = corpus.save_sample("cars", "lexus", b"GIF89a").unwrap_err();
        assert!(matches!(err, FeedbackError::Decode(_)));
        assert!(!corpus.label_dir("cars", "lexus").exists());
    }

    #[test]
    fn labels_are_union_of_seeds_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.save_sample("cars", "tesla", PNG).unwrap();
        corpus.save_sample("cars", "audi", PNG).unwrap();
        fs::write(corpus.domain_dir("cars").join("notes.txt"), "x").unwrap();

        let seeds = vec!["mazda".to_string(), "audi".to_string()];
        assert_eq!(corpus.labels("cars", &seeds).unwrap(), vec!["audi", "mazda", "tesla"]);
    }

    #[test]
    fn ignore_non_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.save_sample("cars", "audi", JPG).unwrap();
        fs::write(corpus.label_dir("cars", "audi").join("README.md"), "x").unwrap();
        fs::write(corpus.label_dir("cars", "audi").join("upper.JPEG"), JPG).unwrap();
        assert_eq!(corpus.images("cars", "audi").unwrap().len(), 2);
    }

    #[test]
    fn dedup_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.save_sample("cars", "audi", JPG).unwrap();

        let mut known = corpus.content_hashes("cars", "audi").unwrap();
        assert!(corpus.add_unique("cars", "audi", JPG, &mut known).unwrap().is_none());
        assert!(corpus.add_unique("cars", "audi", PNG, &mut known).unwrap().is_some());
        assert!(corpus.add_unique("cars", "audi", PNG, &mut known).unwrap().is_none());
        assert_eq!(corpus.count_samples("cars", "audi").unwrap(), 2);
    }

    #[test]
    fn dedup_across_stale_hash_sets() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        let mut first = corpus.content_hashes("cars", "audi").unwrap();
        let mut second = corpus.content_hashes("cars", "audi").unwrap();

        assert!(corpus.add_unique("cars", "audi", PNG, &mut first).unwrap().is_some());
        assert!(corpus.add_unique("cars", "audi", PNG, &mut second).unwrap().is_none());
        assert!(second.contains(&blake3::hash(PNG)));
        assert_eq!(corpus.count_samples("cars", "audi").unwrap(), 1);
    }
}
