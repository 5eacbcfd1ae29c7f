use anyhow::{Result, anyhow};
use linfa::ParamGuard;
use linfa::composing::platt_scaling::{PlattParams, platt_newton_method};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Platt 缩放：把决策值映射为概率 `P(y=1|f) = 1 / (1 + exp(A·f + B))`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sigmoid {
    a: f64,
    b: f64,
}

impl Sigmoid {
    /// 在交叉验证得到的决策值上求解 A、B
    pub fn fit(dec: ArrayView1<f64>, positive: ArrayView1<bool>) -> Result<Self> {
        let params = PlattParams::<f64, ()>::default().check().map_err(|e| anyhow!("{e}"))?;
        let (a, b) = platt_newton_method(dec, positive, &params)
            .map_err(|e| anyhow!("sigmoid 参数求解失败：{e}"))?;
        Ok(Self { a, b })
    }

    pub fn probability(&self, dec: f64) -> f64 {
        let fab = dec * self.a + self.b;
        if fab >= 0.0 {
            let e = (-fab).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + fab.exp())
        }
    }
}
