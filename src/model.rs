use na::{DMatrix, DVector};

use crate::backend::{mat_vec, Scalar};
use crate::error::{ensure_dim, Result};

/// 離散時間状態空間モデル
/// x⁺ = A x + B u
/// y  = C x + D u
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSs {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub c: DMatrix<f64>,
    pub d: DMatrix<f64>,
    pub x0_est: DVector<f64>,
}

impl ModelSs {
    pub fn new(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        c: DMatrix<f64>,
        d: DMatrix<f64>,
        x0_est: DVector<f64>,
    ) -> Result<Self> {
        let n = a.nrows();
        ensure_dim("model A cols", n, a.ncols())?;
        ensure_dim("model B rows", n, b.nrows())?;
        ensure_dim("model C cols", n, c.ncols())?;
        ensure_dim("model D rows", c.nrows(), d.nrows())?;
        ensure_dim("model D cols", b.ncols(), d.ncols())?;
        ensure_dim("model initial state", n, x0_est.len())?;
        Ok(Self { a, b, c, d, x0_est })
    }

    /// 零モデル (推定前の初期値)
    pub fn zeros(dim_state: usize, dim_action: usize, dim_output: usize) -> Self {
        Self {
            a: DMatrix::zeros(dim_state, dim_state),
            b: DMatrix::zeros(dim_state, dim_action),
            c: DMatrix::zeros(dim_output, dim_state),
            d: DMatrix::zeros(dim_output, dim_action),
            x0_est: DVector::zeros(dim_state),
        }
    }

    pub fn dim_state(&self) -> usize {
        self.a.nrows()
    }

    pub fn dim_action(&self) -> usize {
        self.b.ncols()
    }

    pub fn dim_output(&self) -> usize {
        self.c.nrows()
    }

    pub fn update_pars(&mut self, a: DMatrix<f64>, b: DMatrix<f64>, c: DMatrix<f64>, d: DMatrix<f64>) {
        self.a = a;
        self.b = b;
        self.c = c;
        self.d = d;
    }

    pub fn update_ic(&mut self, x0_est: DVector<f64>) {
        self.x0_est = x0_est;
    }

    pub fn step<S: Scalar>(&self, x: &[S], u: &[S]) -> Vec<S> {
        mat_vec(&self.a, x)
            .into_iter()
            .zip(mat_vec(&self.b, u))
            .map(|(ax, bu)| ax + bu)
            .collect()
    }

    pub fn output<S: Scalar>(&self, x: &[S], u: &[S]) -> Vec<S> {
        mat_vec(&self.c, x)
            .into_iter()
            .zip(mat_vec(&self.d, u))
            .map(|(cx, du)| cx + du)
            .collect()
    }

    /// 入力列に対する出力応答 (自由応答シミュレーション)
    /// 出力 k は x_k から計算し、x_{k+1} = A x_k + B u_k
    pub fn dss_sim(&self, inputs: &[DVector<f64>], x0: &DVector<f64>) -> Vec<DVector<f64>> {
        let mut x = x0.clone();
        let mut ys = Vec::with_capacity(inputs.len());
        for u in inputs {
            ys.push(&self.c * &x + &self.d * u);
            x = &self.a * &x + &self.b * u;
        }
        ys
    }
}
