use anyhow::{Result, ensure};
use linfa::prelude::*;
use linfa_preprocessing::linear_scaling::LinearScaler;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// 按维度做零均值、单位方差的标准化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    inner: LinearScaler<f64>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        ensure!(x.nrows() > 0, "无法在空数据集上拟合标准化器");
        let dataset = DatasetBase::from(x.clone());
        let inner = LinearScaler::standard().fit(&dataset)?;
        Ok(Self { inner })
    }

    /// 输入维度
    pub fn dim(&self) -> usize {
        self.inner.offsets().len()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        self.inner.transform(x.clone())
    }

    pub fn transform_row(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let row = self.inner.transform(x.insert_axis(Axis(0)).to_owned());
        row.index_axis_move(Axis(0), 0)
    }
}
