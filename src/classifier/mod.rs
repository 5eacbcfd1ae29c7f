//! 基于归一化直方图的线性分类器，包含训练、概率校准和留出集评估

mod platt;
mod scaler;
mod split;
mod svm;

use anyhow::{Result, ensure};
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

pub use self::platt::Sigmoid;
pub use self::scaler::StandardScaler;
pub use self::split::{class_counts, stratified_folds, stratified_split};
pub use self::svm::LinearSvm;

/// 留出集占比
pub const TEST_RATIO: f64 = 0.2;
/// 概率校准的最大折数
pub const MAX_CALIBRATION_FOLDS: usize = 3;

/// 单次预测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// 标签序号
    pub index: usize,
    /// 最大类别的后验概率，范围 [0, 1]
    pub confidence: f64,
}

/// 校准后的一对多线性分类器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classifier {
    svm: LinearSvm,
    /// 每个类别一个 sigmoid，样本不足时为 `None`
    calibration: Option<Vec<Sigmoid>>,
}

impl Classifier {
    pub fn n_classes(&self) -> usize {
        self.svm.n_classes()
    }

    pub fn dim(&self) -> usize {
        self.svm.dim()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    /// 各类别的概率，未校准时返回 `None`
    pub fn predict_proba(&self, x: ArrayView1<f64>) -> Option<Array1<f64>> {
        let calibration = self.calibration.as_ref()?;
        let dec = self.svm.decision(x);
        let mut proba =
            dec.iter().zip(calibration).map(|(&f, s)| s.probability(f)).collect::<Array1<_>>();
        let sum = proba.sum();
        if sum > 0.0 {
            proba /= sum;
        } else {
            proba.fill(1.0 / self.n_classes() as f64);
        }
        Some(proba)
    }

    /// 预测标签序号与置信度
    ///
    /// 未校准的模型直接取决策值最大的类别，置信度固定为 `1 / 类别数`。
    pub fn predict(&self, x: ArrayView1<f64>) -> Prediction {
        match self.predict_proba(x) {
            Some(proba) => {
                let (index, confidence) = argmax(proba.iter().copied());
                Prediction { index, confidence }
            }
            None => {
                let (index, _) = argmax(self.svm.decision(x).iter().copied());
                Prediction { index, confidence: 1.0 / self.n_classes() as f64 }
            }
        }
    }
}

/// 最大值及其下标，相同时取下标最小者
fn argmax(values: impl Iterator<Item = f64>) -> (usize, f64) {
    values.enumerate().fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

/// 分类器训练参数
#[derive(Debug, Clone, Copy)]
pub struct FitParams {
    pub c: f64,
    pub seed: u64,
}

/// 拟合标准化器与校准后的分类器
///
/// `x` 为归一化后的直方图，`y` 为标签序号。
pub fn fit(
    x: &Array2<f64>,
    y: &[usize],
    n_classes: usize,
    params: FitParams,
) -> Result<(StandardScaler, Classifier)> {
    ensure!(x.nrows() == y.len(), "样本数与标签数不一致");
    ensure!(n_classes >= 2, "至少需要两个类别");

    let scaler = StandardScaler::fit(x)?;
    let xs = scaler.transform(x);
    let svm = LinearSvm::fit(&xs, y, n_classes, params.c)?;

    let smallest = class_counts(y, n_classes).into_iter().min().unwrap_or(0);
    let calibration = if smallest < 2 {
        warn!("最小类别只有 {smallest} 个训练样本，跳过概率校准");
        None
    } else {
        let folds = MAX_CALIBRATION_FOLDS.min(smallest);
        match calibrate(&xs, y, n_classes, folds, params) {
            Ok(sigmoids) => Some(sigmoids),
            Err(e) => {
                warn!("概率校准失败，使用未校准的模型：{e:#}");
                None
            }
        }
    };

    Ok((scaler, Classifier { svm, calibration }))
}

/// 使用 k 折交叉验证得到的决策值，为每个类别拟合一个 sigmoid
fn calibrate(
    xs: &Array2<f64>,
    y: &[usize],
    n_classes: usize,
    k: usize,
    params: FitParams,
) -> Result<Vec<Sigmoid>> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut dec = Array2::<f64>::zeros((y.len(), n_classes));

    for fold in stratified_folds(y, k, &mut rng) {
        let train = (0..y.len()).filter(|i| fold.binary_search(i).is_err()).collect::<Vec<_>>();
        let x_train = xs.select(ndarray::Axis(0), &train);
        let y_train = train.iter().map(|&i| y[i]).collect::<Vec<_>>();
        let svm = LinearSvm::fit(&x_train, &y_train, n_classes, params.c)?;
        for &i in &fold {
            dec.row_mut(i).assign(&svm.decision(xs.row(i)));
        }
    }

    (0..n_classes)
        .map(|class| {
            let positive = y.iter().map(|&label| label == class).collect::<Array1<_>>();
            Sigmoid::fit(dec.column(class), positive.view())
        })
        .collect()
}

/// 留出集评估结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// 留出集准确率，留出集为空时为 `None`
    pub accuracy: Option<f64>,
    /// `confusion[真实][预测]`
    pub confusion: Vec<Vec<usize>>,
    pub train_size: usize,
    pub test_size: usize,
    /// 评估时使用的模型是否经过校准
    pub calibrated: bool,
}

/// 最终用于发布的模型
pub struct TrainedModel {
    pub scaler: StandardScaler,
    pub classifier: Classifier,
    pub evaluation: Evaluation,
}

/// 完整的训练流程：分层划分、训练并评估，最后在全部数据上重新拟合
///
/// 留出集准确率只用于观测，不影响是否发布。
pub fn train(x: &Array2<f64>, y: &[usize], n_classes: usize, params: FitParams) -> Result<TrainedModel> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let (train_idx, test_idx) = stratified_split(y, TEST_RATIO, &mut rng);
    info!("训练集 {} 个样本，留出集 {} 个样本", train_idx.len(), test_idx.len());

    let x_train = x.select(ndarray::Axis(0), &train_idx);
    let y_train = train_idx.iter().map(|&i| y[i]).collect::<Vec<_>>();
    let (scaler, classifier) = fit(&x_train, &y_train, n_classes, params)?;

    let mut confusion = vec![vec![0; n_classes]; n_classes];
    for &i in &test_idx {
        let pred = classifier.predict(scaler.transform_row(x.row(i)).view());
        confusion[y[i]][pred.index] += 1;
    }
    let accuracy = (!test_idx.is_empty()).then(|| {
        let correct = (0..n_classes).map(|c| confusion[c][c]).sum::<usize>();
        correct as f64 / test_idx.len() as f64
    });
    match accuracy {
        Some(acc) => info!("留出集准确率：{:.2}%", acc * 100.),
        None => warn!("留出集为空，无法计算准确率"),
    }

    let evaluation = Evaluation {
        accuracy,
        confusion,
        train_size: train_idx.len(),
        test_size: test_idx.len(),
        calibrated: classifier.is_calibrated(),
    };

    info!("在全部 {} 个样本上重新训练", y.len());
    let (scaler, classifier) = fit(x, y, n_classes, params)?;

    Ok(TrainedModel { scaler, classifier, evaluation })
}

/// 把直方图列表转为矩阵
pub fn to_matrix(histograms: &[Vec<f32>], dim: usize) -> Array2<f64> {
    let mut x = Array2::zeros((histograms.len(), dim));
    for (mut row, hist) in x.rows_mut().into_iter().zip(histograms) {
        row.iter_mut().zip(hist).for_each(|(dst, &src)| *dst = src as f64);
    }
    x
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    /// 三个类别，每个类别围绕不同的方向加少量噪声
    fn blobs(per_class: usize, seed: u64) -> (Array2<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = vec![];
        let mut y = vec![];
        for class in 0..3 {
            for _ in 0..per_class {
                let mut row = vec![0.0f32; 6];
                row[class * 2] = 1.0 + rng.random::<f32>() * 0.1;
                row[class * 2 + 1] = 0.5 + rng.random::<f32>() * 0.1;
                rows.push(row);
                y.push(class);
            }
        }
        (to_matrix(&rows, 6), y)
    }

    const PARAMS: FitParams = FitParams { c: 1.0, seed: 42 };

    #[test]
    fn train_separable_data() {
        let (x, y) = blobs(10, 1);
        let model = train(&x, &y, 3, PARAMS).unwrap();

        assert!(model.classifier.is_calibrated());
        assert_eq!(model.scaler.dim(), 6);
        assert_eq!(model.classifier.n_classes(), 3);
        assert_eq!(model.evaluation.test_size, 6);
        assert!(model.evaluation.accuracy.unwrap() > 0.9);

        let total: usize = model.evaluation.confusion.iter().flatten().sum();
        assert_eq!(total, model.evaluation.test_size);

        let pred = model.classifier.predict(model.scaler.transform_row(x.row(25)).view());
        assert_eq!(pred.index, 2);
        assert!((0.0..=1.0).contains(&pred.confidence));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let (x, y) = blobs(6, 2);
        let (scaler, classifier) = fit(&x, &y, 3, PARAMS).unwrap();
        let proba = classifier.predict_proba(scaler.transform_row(x.row(0)).view()).unwrap();
        assert!((proba.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_sample_class_skips_calibration() {
        let (x, mut y) = blobs(5, 3);
        // 第三类只保留一个样本
        let keep = (0..y.len()).filter(|&i| y[i] != 2 || i == 10).collect::<Vec<_>>();
        let x = x.select(ndarray::Axis(0), &keep);
        y = keep.iter().map(|&i| y[i]).collect();

        let model = train(&x, &y, 3, PARAMS).unwrap();
        assert!(!model.classifier.is_calibrated());
        assert!(!model.evaluation.calibrated);

        let pred = model.classifier.predict(model.scaler.transform_row(x.row(0)).view());
        assert!((pred.confidence - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn argmax_prefers_lowest_index() {
        assert_eq!(argmax([0.2, 0.5, 0.5].into_iter()), (1, 0.5));
    }
}
