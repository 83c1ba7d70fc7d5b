use log::{debug, warn};
use na::DVector;

use crate::backend::{reshape, sum, Scalar};
use crate::config::ControlMode;
use crate::critic::FeatureModel;
use crate::error::{ensure_dim, Error, Result};
use crate::optimizer::{Bounds, Objective, Optimizer};
use crate::plant::{NominalController, Plant};
use crate::predictor::{PredictionModel, StatePredictor, Trajectory};
use crate::stage_cost::StageCost;

/// 1ティック分の入力 (兄弟コンポーネントは借用するだけ)
pub struct ActorContext<'a, P: Plant, N: NominalController> {
    pub t: f64,
    pub observation: &'a DVector<f64>,
    pub predictor: &'a StatePredictor<P>,
    pub model: PredictionModel<'a>,
    pub stage_cost: &'a StageCost,
    pub critic_features: &'a FeatureModel,
    pub critic_weights: &'a DVector<f64>,
    pub safe: Option<&'a N>,
    pub perturbation: &'a [Vec<f64>],
}

/// 予測ホライゾン上のコスト
struct HorizonCost<'a, 'c, P: Plant, N: NominalController> {
    ctx: &'c ActorContext<'a, P, N>,
    mode: ControlMode,
    n_actor: usize,
    dim_action: usize,
    gamma: f64,
    decrease: f64,
    penalty_weight: f64,
}

impl<P: Plant, N: NominalController> HorizonCost<'_, '_, P, N> {
    fn critic<S: Scalar>(&self, y: &[S], u: &[S]) -> S {
        let w: Vec<S> = crate::backend::lift(self.ctx.critic_weights.as_slice());
        self.ctx.critic_features.value(&w, y, u)
    }

    fn discount<S: Scalar>(&self, k: usize) -> S {
        S::cst(self.gamma.powi(k as i32))
    }
}

impl<P: Plant, N: NominalController> Objective for HorizonCost<'_, '_, P, N> {
    fn eval<S: Scalar>(&self, x: &[S]) -> S {
        let ctx = self.ctx;
        let actions = reshape(x, self.n_actor, self.dim_action);
        let traj = ctx.predictor.predict(
            ctx.t,
            ctx.observation.as_slice(),
            &actions,
            &ctx.model,
            ctx.perturbation,
        );
        let n = traj.len();
        let r = |y: &[S], u: &[S]| ctx.stage_cost.eval(y, u);
        let value_critic = ctx.critic_features.kind == crate::critic::CriticKind::Value;

        match self.mode {
            ControlMode::Rql => {
                if value_critic {
                    let mut terms: Vec<S> = (0..n)
                        .map(|k| self.discount::<S>(k) * r(&traj.observations[k], &traj.actions[k]))
                        .collect();
                    terms.push(self.discount::<S>(n) * self.critic(traj.terminal(), &traj.actions[n - 1]));
                    sum(&terms)
                } else {
                    let mut terms: Vec<S> = (0..n - 1)
                        .map(|k| self.discount::<S>(k) * r(&traj.observations[k], &traj.actions[k]))
                        .collect();
                    let (y, u) = traj.pair(n - 1);
                    terms.push(self.discount::<S>(n - 1) * self.critic(y, u));
                    sum(&terms)
                }
            }
            ControlMode::Sql => {
                let terms: Vec<S> = if value_critic {
                    (1..=n)
                        .map(|k| self.critic(&traj.observations[k], &traj.actions[k - 1]))
                        .collect()
                } else {
                    (0..n).map(|k| self.critic(&traj.observations[k], &traj.actions[k])).collect()
                };
                sum(&terms)
            }
            ControlMode::Jacs => {
                let bootstrap = self.critic(&traj.observations[1], &traj.actions[0]);
                match ctx.safe {
                    Some(safe) => {
                        // 減衰条件 c(y1) - c(y0) + κ dt <= 0 をペナルティ化
                        let g = safe.certificate(&traj.observations[1])
                            - safe.certificate(&traj.observations[0])
                            + S::cst(self.decrease);
                        let relu = (g.clone() + g.abs()) * S::cst(0.5);
                        bootstrap + S::cst(self.penalty_weight) * relu.clone() * relu
                    }
                    None => bootstrap,
                }
            }
            // MPC (および actor を使わないモード)
            _ => {
                let terms: Vec<S> = (0..n)
                    .map(|k| r(&traj.observations[k + 1], &traj.actions[k]))
                    .collect();
                sum(&terms)
            }
        }
    }
}

pub struct Actor {
    mode: ControlMode,
    n_actor: usize,
    dim_action: usize,
    gamma: f64,
    dt: f64,
    safe_decay_rate: f64,
    penalty_weight: f64,
    action_bounds: Bounds,
    horizon_bounds: Bounds,
    action_init: DVector<f64>,
    action_prev: DVector<f64>,
    warm_start: Option<Vec<f64>>,
    optimizer: Optimizer,
}

impl Actor {
    const PENALTY_WEIGHT: f64 = 1e4;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: ControlMode,
        n_actor: usize,
        gamma: f64,
        dt: f64,
        safe_decay_rate: f64,
        action_bounds: Bounds,
        action_init: DVector<f64>,
        optimizer: Optimizer,
    ) -> Result<Self> {
        if !mode.uses_actor() {
            return Err(Error::InvalidConfig(format!("{:?} does not use the actor", mode)));
        }
        if n_actor == 0 {
            return Err(Error::InvalidConfig("actor horizon must be positive".into()));
        }
        let dim_action = action_bounds.len();
        ensure_dim("initial action", dim_action, action_init.len())?;
        let horizon_bounds = Bounds::repeat(&action_bounds.lower, &action_bounds.upper, n_actor)?;
        let mut action_init = action_init;
        action_bounds.project(action_init.as_mut_slice());
        Ok(Self {
            mode,
            n_actor,
            dim_action,
            gamma,
            dt,
            safe_decay_rate,
            penalty_weight: Self::PENALTY_WEIGHT,
            action_bounds,
            horizon_bounds,
            action_prev: action_init.clone(),
            action_init,
            warm_start: None,
            optimizer,
        })
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ControlMode) -> Result<()> {
        if !mode.uses_actor() {
            return Err(Error::InvalidConfig(format!("{:?} does not use the actor", mode)));
        }
        self.mode = mode;
        Ok(())
    }

    pub fn n_actor(&self) -> usize {
        self.n_actor
    }

    pub fn action_bounds(&self) -> &Bounds {
        &self.action_bounds
    }

    pub fn action_prev(&self) -> &DVector<f64> {
        &self.action_prev
    }

    pub fn reset(&mut self) {
        self.warm_start = None;
        self.action_prev = self.action_init.clone();
    }

    fn initial_guess(&self) -> Vec<f64> {
        match &self.warm_start {
            Some(ws) => ws.clone(),
            None => self.action_init.as_slice().repeat(self.n_actor),
        }
    }

    /// 1ステップずらし、最終ステップを繰り返す
    fn shift(&self, x: &[f64]) -> Vec<f64> {
        let m = self.dim_action;
        let mut ws = x[m..].to_vec();
        ws.extend_from_slice(&x[x.len() - m..]);
        ws
    }

    /// 行動列 x で f64 の予測を回し、発散していれば NumericDivergence
    fn rollout<P: Plant, N: NominalController>(
        &self,
        ctx: &ActorContext<P, N>,
        x: &[f64],
    ) -> Result<Trajectory<f64>> {
        let actions = reshape(x, self.n_actor, self.dim_action);
        let traj = ctx.predictor.predict(
            ctx.t,
            ctx.observation.as_slice(),
            &actions,
            &ctx.model,
            ctx.perturbation,
        );
        traj.check_finite()?;
        Ok(traj)
    }

    /// 最適行動列の先頭を返す (後退ホライゾン)
    pub fn compute_action<P: Plant, N: NominalController>(
        &mut self,
        ctx: &ActorContext<P, N>,
    ) -> Result<DVector<f64>> {
        ensure_dim("observation", ctx.stage_cost.dim_observation(), ctx.observation.len())?;
        if self.mode == ControlMode::Jacs && ctx.safe.is_none() {
            return Err(Error::InvalidConfig("stabilizing mode needs a safe controller".into()));
        }

        let cost = HorizonCost {
            ctx,
            mode: self.mode,
            n_actor: self.n_actor,
            dim_action: self.dim_action,
            gamma: self.gamma,
            decrease: self.safe_decay_rate * self.dt,
            penalty_weight: self.penalty_weight,
        };

        let guess = self.initial_guess();
        // 初期値で発散する予測はソルバ失敗と区別する
        self.rollout(ctx, &guess)?;
        let sol = match self.optimizer.minimize(&cost, &guess, &self.horizon_bounds) {
            Ok(sol) => sol,
            Err(Error::Solver(msg)) => {
                warn!("actor solver failed ({}), repeating previous action", msg);
                self.warm_start = Some(self.shift(&guess));
                return Ok(self.action_prev.clone());
            }
            Err(e) => return Err(e),
        };

        let traj = self.rollout(ctx, &sol.x)?;

        let mut action = DVector::from_column_slice(&sol.x[..self.dim_action]);
        if let (ControlMode::Jacs, Some(safe)) = (self.mode, ctx.safe) {
            let c0: f64 = safe.certificate(&traj.observations[0]);
            let c1: f64 = safe.certificate(&traj.observations[1]);
            if c1 - c0 > -self.safe_decay_rate * self.dt {
                debug!("decay condition violated ({:.4e} -> {:.4e}), using safe action", c0, c1);
                action = safe.compute_action(ctx.t, ctx.observation);
                ensure_dim("safe action", self.dim_action, action.len())?;
            }
        }
        self.action_bounds.project(action.as_mut_slice());

        self.warm_start = Some(self.shift(&sol.x));
        self.action_prev = action.clone();
        Ok(action)
    }
}
