use anyhow::Result;
use linfa::prelude::*;
use linfa_svm::Svm;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// 一对多线性 SVM
///
/// 每个类别一个二分类器，决策值为 `f(x) = w·x - rho`，只保存权重用于推理。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSvm {
    /// 形状为 (类别数, 特征维度)
    weights: Array2<f64>,
    rho: Array1<f64>,
}

impl LinearSvm {
    pub fn fit(x: &Array2<f64>, y: &[usize], n_classes: usize, c: f64) -> Result<Self> {
        anyhow::ensure!(x.nrows() == y.len(), "样本数与标签数不一致");

        let models = (0..n_classes)
            .into_par_iter()
            .map(|class| fit_binary(x, y, class, c))
            .collect::<Result<Vec<_>>>()?;

        let mut weights = Array2::zeros((n_classes, x.ncols()));
        let mut rho = Array1::zeros(n_classes);
        for (class, (w, r)) in models.into_iter().enumerate() {
            weights.row_mut(class).assign(&w);
            rho[class] = r;
        }
        Ok(Self { weights, rho })
    }

    pub fn n_classes(&self) -> usize {
        self.weights.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    /// 每个类别的决策值
    pub fn decision(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.weights.dot(&x) - &self.rho
    }

    /// 批量计算决策值，返回形状为 (样本数, 类别数)
    pub fn decision_matrix(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weights.t()) - &self.rho
    }
}

/// 训练 `class` 对其余类别的线性核 SVM，并把对偶解折算成权重向量 `w = Σ αᵢ·xᵢ`
fn fit_binary(x: &Array2<f64>, y: &[usize], class: usize, c: f64) -> Result<(Array1<f64>, f64)> {
    let targets = y.iter().map(|&label| label == class).collect::<Array1<_>>();
    let dataset = Dataset::new(x.clone(), targets);
    let svm = Svm::<_, bool>::params().linear_kernel().pos_neg_weights(c, c).fit(&dataset)?;

    let mut w = Array1::zeros(x.ncols());
    for (row, &alpha) in x.rows().into_iter().zip(&svm.alpha) {
        w.scaled_add(alpha, &row);
    }
    Ok((w, svm.rho))
}
