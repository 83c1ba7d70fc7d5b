use std::time::Duration;

use log::debug;
use optimization_engine::{constraints, panoc::*, Optimizer as _, Problem, SolverError};
use rayon::prelude::*;

use crate::backend::{Expr, Scalar, Tape};
use crate::error::{ensure_dim, Error, Result};

/// 評価モード (Optimizer ごとに一度だけ選ぶ)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// f64 で直接評価し、勾配は中心差分
    Numeric,
    /// 式グラフを一度トレースして使い回す
    Symbolic,
}

/// 決定変数 x に対するスカラーコスト
pub trait Objective: Sync {
    fn eval<S: Scalar>(&self, x: &[S]) -> S;
}

#[derive(Debug, Clone)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        ensure_dim("bounds", lower.len(), upper.len())?;
        if lower.iter().zip(&upper).any(|(l, u)| l > u) {
            return Err(Error::InvalidConfig("lower bound above upper bound".into()));
        }
        Ok(Self { lower, upper })
    }

    /// 1ステップ分の箱制約を n 回並べる
    pub fn repeat(lower: &[f64], upper: &[f64], n: usize) -> Result<Self> {
        Self::new(lower.repeat(n), upper.repeat(n))
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn project(&self, x: &mut [f64]) {
        for ((e, l), u) in x.iter_mut().zip(&self.lower).zip(&self.upper) {
            *e = e.clamp(*l, *u);
        }
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.iter()
            .zip(&self.lower)
            .zip(&self.upper)
            .all(|((e, l), u)| *l <= *e && *e <= *u)
    }
}

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub tolerance: f64,
    pub lbfgs_memory: usize,
    pub max_iter: usize,
    pub max_duration: Option<Duration>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            lbfgs_memory: 10,
            max_iter: 500,
            max_duration: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub x: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub struct Optimizer {
    mode: EvalMode,
    settings: SolverSettings,
    cache: Option<(usize, PANOCCache)>,
}

impl Optimizer {
    const FD_EPS: f64 = 1e-6;

    pub fn new(mode: EvalMode, settings: SolverSettings) -> Self {
        Self {
            mode,
            settings,
            cache: None,
        }
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// このインスタンスのモードでコストを一点評価する
    pub fn evaluate<C: Objective>(&self, cost: &C, x: &[f64]) -> f64 {
        match self.mode {
            EvalMode::Numeric => cost.eval(x),
            EvalMode::Symbolic => Self::trace(cost, x.len()).eval(x),
        }
    }

    pub fn trace<C: Objective>(cost: &C, n: usize) -> Tape {
        let vars = Expr::vars(n);
        Tape::compile(&cost.eval(&vars), n)
    }

    pub fn minimize<C: Objective>(
        &mut self,
        cost: &C,
        initial_guess: &[f64],
        bounds: &Bounds,
    ) -> Result<Solution> {
        let n = initial_guess.len();
        ensure_dim("initial guess", bounds.len(), n)?;
        if n == 0 {
            return Err(Error::Solver("empty decision vector".into()));
        }

        let mut x = initial_guess.to_vec();
        bounds.project(&mut x);

        let tape = match self.mode {
            EvalMode::Symbolic => Some(Self::trace(cost, n)),
            EvalMode::Numeric => None,
        };

        let f = |u: &[f64], c: &mut f64| -> std::result::Result<(), SolverError> {
            *c = match &tape {
                Some(tape) => tape.eval(u),
                None => cost.eval(u),
            };
            if c.is_finite() {
                Ok(())
            } else {
                Err(SolverError::NotFiniteComputation)
            }
        };

        let df = |u: &[f64], grad: &mut [f64]| -> std::result::Result<(), SolverError> {
            match &tape {
                Some(tape) => tape.gradient(u, grad),
                None => Self::fd_gradient(cost, u, grad),
            }
            if grad.iter().all(|g| g.is_finite()) {
                Ok(())
            } else {
                Err(SolverError::NotFiniteComputation)
            }
        };

        let rect = constraints::Rectangle::new(Some(bounds.lower.as_slice()), Some(bounds.upper.as_slice()));
        let problem = Problem::new(&rect, df, f);

        if !matches!(&self.cache, Some((size, _)) if *size == n) {
            let cache = PANOCCache::new(n, self.settings.tolerance, self.settings.lbfgs_memory);
            self.cache = Some((n, cache));
        }
        let cache = match &mut self.cache {
            Some((_, cache)) => cache,
            None => return Err(Error::Solver("solver cache unavailable".into())),
        };

        let mut panoc = PANOCOptimizer::new(problem, cache).with_max_iter(self.settings.max_iter);
        if let Some(dur) = self.settings.max_duration {
            panoc = panoc.with_max_duration(dur);
        }

        let status = panoc
            .solve(&mut x)
            .map_err(|e| Error::Solver(format!("{:?}", e)))?;

        if x.iter().any(|e| !e.is_finite()) {
            return Err(Error::Solver("non-finite solution".into()));
        }
        debug!(
            "solve: n = {}, iters = {}, converged = {}, cost = {:.6e}",
            n,
            status.iterations(),
            status.has_converged(),
            status.cost_value()
        );

        Ok(Solution {
            cost: status.cost_value(),
            iterations: status.iterations(),
            converged: status.has_converged(),
            x,
        })
    }

    // コスト関数の勾配を中心差分で求める(並列化版)
    fn fd_gradient<C: Objective>(cost: &C, u: &[f64], grad: &mut [f64]) {
        grad.par_iter_mut().enumerate().for_each(|(i, g)| {
            let mut u_cpy = u.to_vec();
            u_cpy[i] += Self::FD_EPS;
            let posi: f64 = cost.eval(&u_cpy);
            u_cpy[i] -= 2.0 * Self::FD_EPS;
            let nega: f64 = cost.eval(&u_cpy);
            *g = (posi - nega) / (2.0 * Self::FD_EPS);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{quad_diag, sub_const};

    struct Shifted {
        center: Vec<f64>,
        weights: Vec<f64>,
    }

    impl Objective for Shifted {
        fn eval<S: Scalar>(&self, x: &[S]) -> S {
            let e = sub_const(x, &self.center);
            quad_diag(&e, &self.weights) + x[0].sin() * x[1].cos()
        }
    }

    fn problem() -> Shifted {
        Shifted {
            center: vec![0.5, -1.0, 2.0],
            weights: vec![4.0, 2.0, 1.0],
        }
    }

    #[test]
    fn numeric_and_symbolic_agree() {
        let cost = problem();
        let num = Optimizer::new(EvalMode::Numeric, SolverSettings::default());
        let sym = Optimizer::new(EvalMode::Symbolic, SolverSettings::default());
        for x in [[0.0, 0.0, 0.0], [1.3, -2.2, 0.4], [-7.0, 3.0, 11.0]] {
            let a = num.evaluate(&cost, &x);
            let b = sym.evaluate(&cost, &x);
            assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0), "{} vs {}", a, b);
        }
    }

    #[test]
    fn minimize_respects_bounds_in_both_modes() {
        let cost = Shifted {
            center: vec![0.5, -1.0, 2.0],
            weights: vec![4.0, 2.0, 1.0],
        };
        let bounds = Bounds::new(vec![-1.0; 3], vec![1.0; 3]).unwrap();
        for mode in [EvalMode::Numeric, EvalMode::Symbolic] {
            let mut opt = Optimizer::new(mode, SolverSettings::default());
            let sol = opt.minimize(&cost, &[5.0, 5.0, 5.0], &bounds).unwrap();
            assert!(bounds.contains(&sol.x));
            // 3番目の成分は上限に張り付く
            assert!((sol.x[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn modes_reach_the_same_minimum() {
        struct Bowl;
        impl Objective for Bowl {
            fn eval<S: Scalar>(&self, x: &[S]) -> S {
                quad_diag(&sub_const(x, &[0.3, -0.2]), &[1.0, 3.0])
            }
        }
        let bounds = Bounds::new(vec![-5.0; 2], vec![5.0; 2]).unwrap();
        let mut num = Optimizer::new(EvalMode::Numeric, SolverSettings::default());
        let mut sym = Optimizer::new(EvalMode::Symbolic, SolverSettings::default());
        let a = num.minimize(&Bowl, &[0.0, 0.0], &bounds).unwrap();
        let b = sym.minimize(&Bowl, &[0.0, 0.0], &bounds).unwrap();
        for (x, y) in a.x.iter().zip(&b.x) {
            assert!((x - y).abs() < 1e-4);
        }
        assert!((b.x[0] - 0.3).abs() < 1e-4 && (b.x[1] + 0.2).abs() < 1e-4);
    }

    #[test]
    fn rejects_mismatched_bounds() {
        let mut opt = Optimizer::new(EvalMode::Numeric, SolverSettings::default());
        let bounds = Bounds::new(vec![-1.0; 2], vec![1.0; 2]).unwrap();
        assert!(matches!(
            opt.minimize(&problem(), &[0.0; 3], &bounds),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
