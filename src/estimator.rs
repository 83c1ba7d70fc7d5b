use log::{debug, warn};
use na::{DMatrix, DVector};

use crate::buffer::ExperienceBuffer;
use crate::error::{Error, Result};
use crate::model::ModelSs;

/// バッファから ARX モデルを最小二乗で同定し、状態空間モデルとして保持する
/// 状態は直近 model_order 個の出力を縦に並べたもの
/// z_k = [y_k; y_{k-1}; ...; y_{k-p+1}]
#[derive(Debug, Clone)]
pub struct ModelEstimator {
    model_order: usize,
    dim_output: usize,
    dim_action: usize,
    slots: Vec<Option<ModelSs>>,
    cursor: usize,
    best: Option<usize>,
}

impl ModelEstimator {
    const SVD_EPS: f64 = 1e-10;

    pub fn new(model_order: usize, model_est_checks: usize, dim_output: usize, dim_action: usize) -> Result<Self> {
        if model_order == 0 {
            return Err(Error::InvalidConfig("model order must be positive".into()));
        }
        Ok(Self {
            model_order,
            dim_output,
            dim_action,
            slots: vec![None; model_est_checks.max(1)],
            cursor: 0,
            best: None,
        })
    }

    pub fn model_order(&self) -> usize {
        self.model_order
    }

    pub fn dim_state(&self) -> usize {
        self.model_order * self.dim_output
    }

    /// 同定に必要な最小サンプル数
    pub fn min_samples(&self) -> usize {
        self.model_order + 1
    }

    pub fn best_index(&self) -> Option<usize> {
        self.best
    }

    pub fn candidates(&self) -> impl Iterator<Item = &ModelSs> + '_ {
        self.slots.iter().flatten()
    }

    /// 同定して最良の候補を model に書き込む
    /// サンプル不足なら何もしないで Ok(false)
    pub fn estimate(&mut self, buffer: &ExperienceBuffer, model: &mut ModelSs) -> Result<bool> {
        if buffer.len() < self.min_samples() {
            debug!(
                "model estimation skipped: {} samples < {}",
                buffer.len(),
                self.min_samples()
            );
            return Ok(false);
        }

        let fit = match self.fit(buffer) {
            Some(fit) => fit,
            None => {
                warn!("model estimation failed, keeping previous fit");
                return Ok(false);
            }
        };

        self.slots[self.cursor] = Some(fit);
        self.cursor = (self.cursor + 1) % self.slots.len();

        let mut best = (f64::INFINITY, None);
        for (i, cand) in self.slots.iter().enumerate() {
            if let Some(cand) = cand {
                let r = self.residual(cand, buffer);
                if best.1.is_none() || r < best.0 {
                    best = (r, Some(i));
                }
            }
        }
        self.best = best.1;

        if let Some(chosen) = self.best.and_then(|i| self.slots[i].as_ref()) {
            model.update_pars(chosen.a.clone(), chosen.b.clone(), chosen.c.clone(), chosen.d.clone());
            model.update_ic(chosen.x0_est.clone());
            debug!("model estimated: candidate {:?}, residual {:.4e}", self.best, best.0);
        }
        Ok(true)
    }

    fn fit(&self, buffer: &ExperienceBuffer) -> Option<ModelSs> {
        let p = self.model_order;
        let ny = self.dim_output;
        let nu = self.dim_action;
        let n_reg = p * ny + nu;
        let rows = buffer.len() - p;

        let samples = buffer.snapshot();
        let mut phi = DMatrix::<f64>::zeros(rows, n_reg);
        let mut target = DMatrix::<f64>::zeros(rows, ny);
        for (r, j) in (p - 1..buffer.len() - 1).enumerate() {
            for lag in 0..p {
                phi.view_mut((r, lag * ny), (1, ny))
                    .copy_from(&samples[j - lag].observation.transpose());
            }
            // samples[j+1].action は y_j から y_{j+1} の間ホールドした入力
            phi.view_mut((r, p * ny), (1, nu))
                .copy_from(&samples[j + 1].action.transpose());
            target
                .view_mut((r, 0), (1, ny))
                .copy_from(&samples[j + 1].observation.transpose());
        }

        let theta = phi.svd(true, true).solve(&target, Self::SVD_EPS).ok()?;
        if theta.iter().any(|e| !e.is_finite()) {
            return None;
        }
        let theta_t = theta.transpose();

        let n = p * ny;
        let mut a = DMatrix::<f64>::zeros(n, n);
        a.view_mut((0, 0), (ny, n)).copy_from(&theta_t.view((0, 0), (ny, n)));
        for blk in 1..p {
            a.view_mut((blk * ny, (blk - 1) * ny), (ny, ny))
                .copy_from(&DMatrix::identity(ny, ny));
        }
        let mut b = DMatrix::<f64>::zeros(n, nu);
        b.view_mut((0, 0), (ny, nu)).copy_from(&theta_t.view((0, n), (ny, nu)));
        let mut c = DMatrix::<f64>::zeros(ny, n);
        c.view_mut((0, 0), (ny, ny)).copy_from(&DMatrix::identity(ny, ny));
        let d = DMatrix::<f64>::zeros(ny, nu);

        let x0 = self.state_from_history(samples.iter().take(p).rev().map(|s| &s.observation));
        ModelSs::new(a, b, c, d, x0).ok()
    }

    /// 自由応答シミュレーションの平均二乗出力誤差
    fn residual(&self, model: &ModelSs, buffer: &ExperienceBuffer) -> f64 {
        let p = self.model_order;
        let samples = buffer.snapshot();
        let x0 = self.state_from_history(samples.iter().take(p).rev().map(|s| &s.observation));
        let inputs: Vec<DVector<f64>> = samples[p..].iter().map(|s| s.action.clone()).collect();
        let ys = model.dss_sim(&inputs, &x0);
        let err: f64 = ys
            .iter()
            .zip(&samples[p - 1..])
            .map(|(y, s)| (y - &s.observation).norm_squared())
            .sum();
        let r = err / ys.len() as f64;
        if r.is_finite() {
            r
        } else {
            f64::INFINITY
        }
    }

    /// 新しい順の出力列から状態を組み立てる (足りない分は最古の値で埋める)
    pub fn state_from_history<'a, I>(&self, newest_first: I) -> DVector<f64>
    where
        I: IntoIterator<Item = &'a DVector<f64>>,
    {
        let ny = self.dim_output;
        let mut z = DVector::<f64>::zeros(self.dim_state());
        let mut last: Option<&DVector<f64>> = None;
        let mut it = newest_first.into_iter();
        for blk in 0..self.model_order {
            if let Some(y) = it.next() {
                last = Some(y);
            }
            if let Some(y) = last {
                z.rows_mut(blk * ny, ny).copy_from(y);
            }
        }
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_order_buffer(n: usize) -> ExperienceBuffer {
        // y⁺ = 0.8 y + 0.5 u, 各サンプルは (y_k, u_{k-1})
        let mut buf = ExperienceBuffer::new(n).unwrap();
        let mut y = 1.0;
        let mut u_held = 0.0;
        for k in 0..n {
            buf.push(DVector::from_element(1, y), DVector::from_element(1, u_held));
            let u = ((k * 7) % 5) as f64 - 2.0;
            y = 0.8 * y + 0.5 * u;
            u_held = u;
        }
        buf
    }

    #[test]
    fn recovers_first_order_system() {
        let buf = first_order_buffer(20);
        let mut est = ModelEstimator::new(1, 0, 1, 1).unwrap();
        let mut model = ModelSs::zeros(1, 1, 1);
        assert!(est.estimate(&buf, &mut model).unwrap());
        assert!((model.a[(0, 0)] - 0.8).abs() < 1e-8);
        assert!((model.b[(0, 0)] - 0.5).abs() < 1e-8);
        assert_eq!(model.c[(0, 0)], 1.0);
    }

    #[test]
    fn skips_with_too_few_samples() {
        let buf = first_order_buffer(3);
        let mut est = ModelEstimator::new(3, 0, 1, 1).unwrap();
        let mut model = ModelSs::zeros(3, 1, 1);
        let before = model.clone();
        assert!(!est.estimate(&buf, &mut model).unwrap());
        assert_eq!(model, before);
    }

    #[test]
    fn keeps_best_candidate() {
        let mut est = ModelEstimator::new(1, 3, 1, 1).unwrap();
        let mut model = ModelSs::zeros(1, 1, 1);
        for n in [6, 10, 20] {
            est.estimate(&first_order_buffer(n), &mut model).unwrap();
        }
        assert_eq!(est.candidates().count(), 3);
        assert!(est.best_index().is_some());
        assert!((model.a[(0, 0)] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn higher_order_state_layout() {
        let est = ModelEstimator::new(3, 0, 2, 1).unwrap();
        let y0 = DVector::from_vec(vec![1.0, 2.0]);
        let y1 = DVector::from_vec(vec![3.0, 4.0]);
        let z = est.state_from_history([&y0, &y1]);
        assert_eq!(z.as_slice(), &[1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);
    }
}
