#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use futures::stream::{self, BoxStream, StreamExt};
use logoscope::Engine;
use logoscope::config::{DataDir, LearnOptions, SiftOptions, TrainOptions};
use logoscope::provider::{Sample, SampleProvider};
use logoscope::utils;
use opencv::core::{self, Mat, Point, Scalar};
use opencv::imgproc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const BRANDS: [&str; 8] = ["AUDI", "BMW", "FIAT", "KIA", "MINI", "OPEL", "SEAT", "VOLVO"];

/// 生成一张带有轻微位置扰动的合成标志
pub fn logo(class: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed * 131 + class as u64);
    let mut img =
        Mat::new_rows_cols_with_default(160, 160, core::CV_8UC1, Scalar::all(255.)).unwrap();
    let (dx, dy) = (rng.random_range(-8..=8), rng.random_range(-8..=8));
    let black = Scalar::all(0.);

    match class % 4 {
        0 => imgproc::circle(&mut img, Point::new(80 + dx, 50 + dy), 30, black, 4, imgproc::LINE_8, 0),
        1 => imgproc::line(
            &mut img,
            Point::new(20 + dx, 20 + dy),
            Point::new(140 + dx, 80 + dy),
            black,
            6,
            imgproc::LINE_8,
            0,
        ),
        2 => imgproc::circle(&mut img, Point::new(50 + dx, 50 + dy), 18, black, -1, imgproc::LINE_8, 0),
        _ => imgproc::line(
            &mut img,
            Point::new(80 + dx, 10 + dy),
            Point::new(80 + dx, 90 + dy),
            black,
            10,
            imgproc::LINE_8,
            0,
        ),
    }
    .unwrap();

    let text = BRANDS[class % BRANDS.len()];
    imgproc::put_text(
        &mut img,
        text,
        Point::new(15 + dx, 130 + dy),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0 + rng.random_range(0.0..0.2),
        black,
        3,
        imgproc::LINE_8,
        false,
    )
    .unwrap();

    utils::imencode_png(&img).unwrap()
}

/// 在样本库中为某个领域写入若干标签的合成图片
pub fn seed_corpus(data: &DataDir, domain: &str, labels: &[(usize, &str)], per_label: usize) {
    for &(class, label) in labels {
        let dir = data.corpus().join(domain).join(label);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..per_label {
            fs::write(dir.join(format!("{i:03}.png")), logo(class, i as u64)).unwrap();
        }
    }
}

pub fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
}

/// 返回固定候选列表的样本来源，并记录调用次数
#[derive(Default)]
pub struct StaticProvider {
    pub items: Vec<Result<Vec<u8>, String>>,
    /// 候选列表耗尽后不再产出也不结束，模拟无响应的来源
    pub stall: bool,
    pub calls: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl StaticProvider {
    pub fn new(items: Vec<Result<Vec<u8>, String>>) -> Self {
        Self { items, ..Default::default() }
    }

    pub fn stalling(items: Vec<Result<Vec<u8>, String>>) -> Self {
        Self { items, stall: true, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl SampleProvider for StaticProvider {
    fn fetch<'a>(&'a self, query: &'a str, limit: usize) -> BoxStream<'a, Result<Sample>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        let items = self.items.iter().take(limit * 2).enumerate().map(|(i, item)| match item {
            Ok(bytes) => Ok(Sample { url: format!("mem://{i}"), bytes: bytes.clone() }),
            Err(e) => Err(anyhow!("{e}")),
        });
        let items = stream::iter(items.collect::<Vec<_>>());
        if self.stall { items.chain(stream::pending()).boxed() } else { items.boxed() }
    }
}

pub fn train_options(k: usize) -> TrainOptions {
    TrainOptions { k, max_iter: 20, ..TrainOptions::default() }
}

pub fn engine<P: SampleProvider>(data: &DataDir, k: usize, provider: P) -> Engine<P> {
    let learn = LearnOptions { expand_batch: 5, ..LearnOptions::default() };
    engine_with(data, k, provider, learn)
}

pub fn engine_with<P: SampleProvider>(
    data: &DataDir,
    k: usize,
    provider: P,
    learn: LearnOptions,
) -> Engine<P> {
    Engine::with_provider(data.clone(), SiftOptions::default(), train_options(k), learn, provider, false)
}
