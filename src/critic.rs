use std::str::FromStr;

use log::{debug, warn};
use na::DVector;

use crate::backend::{dot, kron, lift, outer_uptria, square, sum, vstack, Scalar};
use crate::buffer::ExperienceBuffer;
use crate::error::{ensure_dim, Error, Result};
use crate::optimizer::{Bounds, Objective, Optimizer};
use crate::stage_cost::StageCost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticKind {
    /// V(y)
    Value,
    /// Q(y, u)
    ActionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticStructure {
    /// 二次 + 一次
    QuadLin,
    /// 二次 (交差項あり)
    Quadratic,
    /// 二次 (交差項なし)
    QuadNoMix,
    /// y², y⊗u, u² (行動価値のみ)
    QuadMix,
}

impl FromStr for CriticStructure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quad-lin" => Ok(Self::QuadLin),
            "quadratic" => Ok(Self::Quadratic),
            "quad-nomix" => Ok(Self::QuadNoMix),
            "quad-mix" => Ok(Self::QuadMix),
            _ => Err(Error::InvalidConfig(format!("unknown critic structure: {}", s))),
        }
    }
}

/// 特徴量の構造と次元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureModel {
    pub kind: CriticKind,
    pub structure: CriticStructure,
    pub dim_observation: usize,
    pub dim_action: usize,
}

impl FeatureModel {
    pub fn new(
        kind: CriticKind,
        structure: CriticStructure,
        dim_observation: usize,
        dim_action: usize,
    ) -> Result<Self> {
        if kind == CriticKind::Value && structure == CriticStructure::QuadMix {
            return Err(Error::InvalidConfig(
                "quad-mix features need an action-value critic".into(),
            ));
        }
        Ok(Self {
            kind,
            structure,
            dim_observation,
            dim_action,
        })
    }

    fn dim_chi(&self) -> usize {
        match self.kind {
            CriticKind::Value => self.dim_observation,
            CriticKind::ActionValue => self.dim_observation + self.dim_action,
        }
    }

    pub fn dim(&self) -> usize {
        let n = self.dim_chi();
        match self.structure {
            CriticStructure::QuadLin => n * (n + 1) / 2 + n,
            CriticStructure::Quadratic => n * (n + 1) / 2,
            CriticStructure::QuadNoMix => n,
            CriticStructure::QuadMix => {
                self.dim_observation + self.dim_observation * self.dim_action + self.dim_action
            }
        }
    }

    pub fn features<S: Scalar>(&self, observation: &[S], action: &[S]) -> Vec<S> {
        let chi = match self.kind {
            CriticKind::Value => observation.to_vec(),
            CriticKind::ActionValue => vstack(observation, action),
        };
        match self.structure {
            CriticStructure::QuadLin => vstack(&outer_uptria(&chi), &chi),
            CriticStructure::Quadratic => outer_uptria(&chi),
            CriticStructure::QuadNoMix => square(&chi),
            CriticStructure::QuadMix => {
                let head = vstack(&square(observation), &kron(observation, action));
                vstack(&head, &square(action))
            }
        }
    }

    pub fn value<S: Scalar>(&self, weights: &[S], observation: &[S], action: &[S]) -> S {
        dot(weights, &self.features(observation, action))
    }
}

/// TD 損失 (重みが決定変数)
struct TdLoss {
    features: FeatureModel,
    gamma: f64,
    observations: Vec<Vec<f64>>,
    actions: Vec<Vec<f64>>,
    stage_costs: Vec<f64>,
}

impl Objective for TdLoss {
    fn eval<S: Scalar>(&self, w: &[S]) -> S {
        let q: Vec<S> = self
            .observations
            .iter()
            .zip(&self.actions)
            .map(|(y, u)| self.features.value(w, &lift(y), &lift(u)))
            .collect();
        let td: Vec<S> = (1..q.len())
            .map(|k| {
                let e = q[k - 1].clone() - S::cst(self.gamma) * q[k].clone() - S::cst(self.stage_costs[k - 1]);
                e.clone() * e
            })
            .collect();
        S::cst(0.5) * sum(&td)
    }
}

pub struct Critic {
    features: FeatureModel,
    n_critic: usize,
    gamma: f64,
    weights: DVector<f64>,
    bounds: Bounds,
    optimizer: Optimizer,
}

impl Critic {
    pub fn new(
        features: FeatureModel,
        n_critic: usize,
        gamma: f64,
        weights_init: DVector<f64>,
        weight_bounds: (f64, f64),
        optimizer: Optimizer,
    ) -> Result<Self> {
        if n_critic < 2 {
            return Err(Error::InvalidConfig("critic stack needs at least two samples".into()));
        }
        ensure_dim("critic weights", features.dim(), weights_init.len())?;
        let bounds = Bounds::new(
            vec![weight_bounds.0; features.dim()],
            vec![weight_bounds.1; features.dim()],
        )?;
        let mut weights = weights_init;
        bounds.project(weights.as_mut_slice());
        Ok(Self {
            features,
            n_critic,
            gamma,
            weights,
            bounds,
            optimizer,
        })
    }

    pub fn kind(&self) -> CriticKind {
        self.features.kind
    }

    pub fn feature_model(&self) -> &FeatureModel {
        &self.features
    }

    pub fn n_critic(&self) -> usize {
        self.n_critic
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    pub fn value<S: Scalar>(&self, observation: &[S], action: &[S]) -> S {
        let w: Vec<S> = lift(self.weights.as_slice());
        self.features.value(&w, observation, action)
    }

    pub fn value_f64(&self, observation: &DVector<f64>, action: &DVector<f64>) -> f64 {
        self.value::<f64>(observation.as_slice(), action.as_slice())
    }

    /// 現在の重みでの TD 損失 (サンプル不足なら None)
    pub fn loss(&self, buffer: &ExperienceBuffer, stage_cost: &StageCost) -> Option<f64> {
        let loss = self.td_loss(buffer, stage_cost)?;
        Some(loss.eval::<f64>(self.weights.as_slice()))
    }

    fn td_loss(&self, buffer: &ExperienceBuffer, stage_cost: &StageCost) -> Option<TdLoss> {
        if buffer.len() < self.n_critic {
            return None;
        }
        let stack: Vec<_> = buffer.latest(self.n_critic).collect();
        Some(TdLoss {
            features: self.features,
            gamma: self.gamma,
            observations: stack.iter().map(|s| s.observation.as_slice().to_vec()).collect(),
            actions: stack.iter().map(|s| s.action.as_slice().to_vec()).collect(),
            stage_costs: stack
                .iter()
                .map(|s| stage_cost.eval_f64(&s.observation, &s.action))
                .collect(),
        })
    }

    /// 直近 Ncritic 件で重みを更新する
    /// サンプル不足・ソルバ失敗のときは重みを変えずに Ok(false)
    pub fn update(&mut self, buffer: &ExperienceBuffer, stage_cost: &StageCost) -> Result<bool> {
        let loss = match self.td_loss(buffer, stage_cost) {
            Some(loss) => loss,
            None => {
                debug!(
                    "critic update skipped: {} samples < {}",
                    buffer.len(),
                    self.n_critic
                );
                return Ok(false);
            }
        };

        match self
            .optimizer
            .minimize(&loss, self.weights.as_slice(), &self.bounds)
        {
            Ok(sol) => {
                self.weights = DVector::from_vec(sol.x);
                debug!("critic updated: loss = {:.4e}", sol.cost);
                Ok(true)
            }
            Err(Error::Solver(msg)) => {
                warn!("critic solver failed ({}), keeping weights", msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{EvalMode, SolverSettings};

    fn critic(kind: CriticKind, structure: CriticStructure, n_critic: usize) -> Critic {
        let fm = FeatureModel::new(kind, structure, 2, 1).unwrap();
        Critic::new(
            fm,
            n_critic,
            0.9,
            DVector::from_element(fm.dim(), 1.0),
            (-1e3, 1e3),
            Optimizer::new(EvalMode::Symbolic, SolverSettings::default()),
        )
        .unwrap()
    }

    #[test]
    fn feature_dimensions() {
        let dim = |k, s| FeatureModel::new(k, s, 2, 1).unwrap().dim();
        assert_eq!(dim(CriticKind::Value, CriticStructure::QuadLin), 5);
        assert_eq!(dim(CriticKind::Value, CriticStructure::Quadratic), 3);
        assert_eq!(dim(CriticKind::ActionValue, CriticStructure::Quadratic), 6);
        assert_eq!(dim(CriticKind::ActionValue, CriticStructure::QuadNoMix), 3);
        assert_eq!(dim(CriticKind::ActionValue, CriticStructure::QuadMix), 5);
        assert!(FeatureModel::new(CriticKind::Value, CriticStructure::QuadMix, 2, 1).is_err());

        let fm = FeatureModel::new(CriticKind::ActionValue, CriticStructure::QuadMix, 2, 1).unwrap();
        assert_eq!(fm.features(&[1.0, 2.0], &[3.0]).len(), fm.dim());
    }

    #[test]
    fn value_is_weighted_features() {
        let c = critic(CriticKind::ActionValue, CriticStructure::QuadNoMix, 3);
        let y = DVector::from_vec(vec![1.0, -2.0]);
        let u = DVector::from_vec(vec![3.0]);
        assert_eq!(c.value_f64(&y, &u), 1.0 + 4.0 + 9.0);
    }

    #[test]
    fn no_update_before_enough_samples() {
        let stage = StageCost::quadratic(&[1.0, 1.0, 0.1], 2, 1).unwrap();
        let mut c = critic(CriticKind::ActionValue, CriticStructure::QuadNoMix, 4);
        let mut buf = ExperienceBuffer::new(10).unwrap();
        let before = c.weights().clone();
        for k in 0..3 {
            buf.push(DVector::from_element(2, k as f64), DVector::from_element(1, 0.5));
            assert!(!c.update(&buf, &stage).unwrap());
            assert_eq!(c.weights(), &before);
        }
        assert!(c.loss(&buf, &stage).is_none());
    }

    #[test]
    fn td_loss_agrees_between_eval_modes() {
        let stage = StageCost::quadratic(&[1.0, 2.0, 0.1], 2, 1).unwrap();
        let mut buf = ExperienceBuffer::new(8).unwrap();
        for k in 0..8 {
            let k = k as f64;
            buf.push(
                DVector::from_vec(vec![1.5 - 0.3 * k, 0.2 * k]),
                DVector::from_element(1, (0.7 * k).sin()),
            );
        }
        let num = Optimizer::new(EvalMode::Numeric, SolverSettings::default());
        let sym = Optimizer::new(EvalMode::Symbolic, SolverSettings::default());
        for (kind, structure) in [
            (CriticKind::Value, CriticStructure::QuadLin),
            (CriticKind::ActionValue, CriticStructure::Quadratic),
            (CriticKind::ActionValue, CriticStructure::QuadMix),
        ] {
            let c = critic(kind, structure, 6);
            let loss = c.td_loss(&buf, &stage).unwrap();
            let dim = c.feature_model().dim();
            for w in [
                vec![0.0; dim],
                vec![1.0; dim],
                (0..dim).map(|i| 0.4 * i as f64 - 1.1).collect::<Vec<_>>(),
            ] {
                let a = num.evaluate(&loss, &w);
                let b = sym.evaluate(&loss, &w);
                assert!(
                    (a - b).abs() <= 1e-9 * a.abs().max(1.0),
                    "{:?}/{:?}: {} vs {}",
                    kind,
                    structure,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn update_reduces_td_loss() {
        let stage = StageCost::quadratic(&[1.0, 1.0, 0.1], 2, 1).unwrap();
        let mut c = critic(CriticKind::Value, CriticStructure::QuadNoMix, 5);
        let mut buf = ExperienceBuffer::new(10).unwrap();
        let mut y = vec![2.0, -1.0];
        for _ in 0..8 {
            buf.push(DVector::from_vec(y.clone()), DVector::from_element(1, 0.0));
            y = y.iter().map(|e| 0.7 * e).collect();
        }
        let before = c.loss(&buf, &stage).unwrap();
        assert!(c.update(&buf, &stage).unwrap());
        let after = c.loss(&buf, &stage).unwrap();
        assert!(after < before, "{} !< {}", after, before);
    }
}
