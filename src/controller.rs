use std::sync::Arc;

use log::{debug, error, info};
use na::DVector;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::actor::{Actor, ActorContext};
use crate::buffer::ExperienceBuffer;
use crate::config::{Config, ControlMode};
use crate::critic::{Critic, CriticKind, FeatureModel};
use crate::error::{ensure_dim, Error, Result};
use crate::estimator::ModelEstimator;
use crate::model::ModelSs;
use crate::optimizer::{Bounds, Optimizer};
use crate::plant::{NominalController, Plant};
use crate::predictor::{PredictionModel, ProbingNoise, StatePredictor};
use crate::stage_cost::StageCost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// 1ティック分の記録 (ロガー向け)
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub t: f64,
    pub observation: DVector<f64>,
    pub stage_cost: f64,
    pub accum_obj: f64,
    pub action: DVector<f64>,
}

pub struct Controller<P: Plant, N: NominalController> {
    config: Config,
    state: RunState,
    mode: ControlMode,
    predictor: StatePredictor<P>,
    stage_cost: StageCost,
    buffer: ExperienceBuffer,
    critic: Critic,
    actor: Actor,
    estimator: ModelEstimator,
    surrogate: ModelSs,
    surrogate_ready: bool,
    safe: Option<Arc<N>>,
    action_bounds: Bounds,
    t0: f64,
    t_last: Option<f64>,
    tick: usize,
    observation: DVector<f64>,
    action: DVector<f64>,
    stage_cost_last: f64,
    accum_obj: f64,
    rng: Xoshiro256PlusPlus,
}

impl<P: Plant, N: NominalController> Controller<P, N> {
    const TIME_EPS: f64 = 1e-9;

    pub fn new(config: Config, plant: P, safe: Option<Arc<N>>) -> Result<Self> {
        let dim_obs = plant.dim_observation();
        let dim_act = plant.dim_action();
        config.validate(dim_obs, dim_act)?;
        Self::check_mode(config.mode, config.critic_kind(), safe.is_some())?;

        let stage_cost = StageCost::new(
            config.stage_cost_structure,
            &config.r1_diag,
            &config.r2_diag,
            &config.observation_target,
            dim_obs,
            dim_act,
        )?;
        let predictor = StatePredictor::new(plant, config.pred_step_size, config.n_actor)?;
        let buffer = ExperienceBuffer::new(config.buffer_size)?;

        let features = FeatureModel::new(config.critic_kind(), config.critic_structure, dim_obs, dim_act)?;
        let weights_init = match &config.critic_weights_init {
            Some(w) => DVector::from_column_slice(w),
            None => DVector::from_element(features.dim(), 1.0),
        };
        let critic = Critic::new(
            features,
            config.n_critic,
            config.gamma,
            weights_init,
            config.critic_weight_bounds,
            Optimizer::new(config.eval_mode, config.solver.clone()),
        )?;

        let action_bounds = Bounds::new(config.action_min.clone(), config.action_max.clone())?;
        let actor_mode = if config.mode.uses_actor() {
            config.mode
        } else {
            ControlMode::Mpc
        };
        let actor = Actor::new(
            actor_mode,
            config.n_actor,
            config.gamma,
            config.dt,
            config.safe_decay_rate,
            action_bounds.clone(),
            DVector::from_column_slice(&config.action_init),
            Optimizer::new(config.eval_mode, config.solver.clone()),
        )?;

        let estimator = ModelEstimator::new(config.model_order, config.model_est_checks, dim_obs, dim_act)?;
        let surrogate = ModelSs::zeros(estimator.dim_state(), dim_act, dim_obs);

        let mut action = DVector::from_column_slice(&config.action_init);
        action_bounds.project(action.as_mut_slice());

        info!(
            "controller: mode {}, dt {}, Nactor {}, buffer {}, critic {:?}",
            config.mode,
            config.dt,
            config.n_actor,
            config.buffer_size,
            critic.kind()
        );

        Ok(Self {
            mode: config.mode,
            state: RunState::Idle,
            predictor,
            stage_cost,
            buffer,
            critic,
            actor,
            estimator,
            surrogate,
            surrogate_ready: false,
            safe,
            action_bounds,
            t0: 0.0,
            t_last: None,
            tick: 0,
            observation: DVector::zeros(dim_obs),
            action,
            stage_cost_last: 0.0,
            accum_obj: 0.0,
            rng: Xoshiro256PlusPlus::seed_from_u64(config.seed),
            config,
        })
    }

    fn check_mode(mode: ControlMode, critic_kind: CriticKind, has_safe: bool) -> Result<()> {
        match mode {
            ControlMode::Nominal | ControlMode::Jacs if !has_safe => Err(Error::InvalidConfig(
                format!("{} mode needs a safe controller", mode),
            )),
            ControlMode::Jacs if critic_kind != CriticKind::Value => Err(Error::InvalidConfig(
                "JACS mode needs a value critic".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ControlMode) -> Result<()> {
        Self::check_mode(mode, self.critic.kind(), self.safe.is_some())?;
        if mode.uses_actor() {
            self.actor.set_mode(mode)?;
        }
        info!("control mode: {} -> {}", self.mode, mode);
        self.mode = mode;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RunState::Stopped => Err(Error::Stopped),
            RunState::Running => Ok(()),
            _ => {
                info!("controller started at t = {}", self.t0);
                self.state = RunState::Running;
                Ok(())
            }
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            RunState::Stopped => Err(Error::Stopped),
            RunState::Running => {
                info!("controller paused");
                self.state = RunState::Paused;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            RunState::Stopped => Err(Error::Stopped),
            RunState::Paused => {
                info!("controller resumed");
                self.state = RunState::Running;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn stop(&mut self) {
        if self.state != RunState::Stopped {
            info!("controller stopped after {} ticks", self.tick);
        }
        self.state = RunState::Stopped;
    }

    /// 学習済みの critic と推定モデルは残す
    pub fn reset(&mut self, t0: f64) {
        info!("controller reset: t0 = {}, accumulated objective was {:.4e}", t0, self.accum_obj);
        self.t0 = t0;
        self.t_last = None;
        self.tick = 0;
        self.accum_obj = 0.0;
        self.stage_cost_last = 0.0;
        self.buffer.clear();
        self.actor.reset();
        self.action = self.actor.action_prev().clone();
        self.state = RunState::Idle;
    }

    pub fn accum_obj(&self) -> f64 {
        self.accum_obj
    }

    pub fn tick_count(&self) -> usize {
        self.tick
    }

    pub fn action(&self) -> &DVector<f64> {
        &self.action
    }

    pub fn buffer(&self) -> &ExperienceBuffer {
        &self.buffer
    }

    pub fn critic(&self) -> &Critic {
        &self.critic
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn surrogate(&self) -> &ModelSs {
        &self.surrogate
    }

    pub fn estimator(&self) -> &ModelEstimator {
        &self.estimator
    }

    pub fn stage_cost(&self) -> &StageCost {
        &self.stage_cost
    }

    pub fn record(&self) -> TickRecord {
        TickRecord {
            t: self.t_last.unwrap_or(self.t0),
            observation: self.observation.clone(),
            stage_cost: self.stage_cost_last,
            accum_obj: self.accum_obj,
            action: self.action.clone(),
        }
    }

    /// ゼロ次ホールド: dt 経過したときだけ新しいティックを実行する
    pub fn compute_action_sampled(&mut self, t: f64, observation: &DVector<f64>) -> Result<DVector<f64>> {
        match self.state {
            RunState::Stopped => return Err(Error::Stopped),
            RunState::Paused => return Ok(self.action.clone()),
            RunState::Idle => self.start()?,
            RunState::Running => {}
        }
        let due = match self.t_last {
            None => true,
            Some(t_last) => t - t_last >= self.config.dt - Self::TIME_EPS,
        };
        if due {
            self.tick(t, observation)
        } else {
            Ok(self.action.clone())
        }
    }

    /// サンプリング周期に関係なく1ティック進める
    pub fn compute_action(&mut self, t: f64, observation: &DVector<f64>) -> Result<DVector<f64>> {
        match self.state {
            RunState::Stopped => return Err(Error::Stopped),
            RunState::Paused => return Ok(self.action.clone()),
            RunState::Idle => self.start()?,
            RunState::Running => {}
        }
        self.tick(t, observation)
    }

    fn tick(&mut self, t: f64, observation: &DVector<f64>) -> Result<DVector<f64>> {
        ensure_dim("observation", self.stage_cost.dim_observation(), observation.len())?;
        self.observation = observation.clone();
        let k = self.tick;

        // 観測と、その観測に至るまでホールドしていた行動を記録
        self.buffer.push(observation.clone(), self.action.clone());

        if self.config.is_est_model
            && k >= self.config.model_est_stage
            && (k - self.config.model_est_stage) % self.config.model_est_period == 0
        {
            if self.estimator.estimate(&self.buffer, &mut self.surrogate)? {
                self.surrogate_ready = true;
            }
        }

        if matches!(self.mode, ControlMode::Rql | ControlMode::Sql | ControlMode::Jacs)
            && k % self.config.critic_period == 0
        {
            self.critic.update(&self.buffer, &self.stage_cost)?;
        }

        let mut action = match self.mode {
            ControlMode::Manual => DVector::from_column_slice(&self.config.action_manual),
            ControlMode::Nominal => match &self.safe {
                Some(safe) => safe.compute_action(t, observation),
                None => return Err(Error::InvalidConfig("nominal mode needs a safe controller".into())),
            },
            _ => self.actor_action(t, observation)?,
        };
        ensure_dim("action", self.action_bounds.len(), action.len())?;
        self.action_bounds.project(action.as_mut_slice());

        self.stage_cost_last = self.stage_cost.eval_f64(observation, &action);
        self.accum_obj += self.stage_cost_last;
        debug!(
            "tick {} t = {:.3}: r = {:.4e}, J = {:.4e}, u = {:?}",
            k,
            t,
            self.stage_cost_last,
            self.accum_obj,
            action.as_slice()
        );

        self.tick += 1;
        self.t_last = Some(t);
        self.action = action.clone();
        Ok(action)
    }

    fn actor_action(&mut self, t: f64, observation: &DVector<f64>) -> Result<DVector<f64>> {
        let noise = ProbingNoise::new(self.config.prob_noise_pow, self.rng.gen());
        let perturbation = if noise.is_active() {
            noise.sample(self.config.n_actor, self.action_bounds.len())
        } else {
            Vec::new()
        };

        let use_surrogate = self.config.is_est_model
            && self.surrogate_ready
            && self.tick >= self.config.model_est_stage;
        // バッファの最新が現在の観測
        let surrogate_state = if use_surrogate {
            let history = self.buffer.iter().rev().map(|s| &s.observation);
            Some(self.estimator.state_from_history(history))
        } else {
            None
        };
        let model = match &surrogate_state {
            Some(state) => PredictionModel::Surrogate {
                model: &self.surrogate,
                state,
            },
            None => PredictionModel::Plant,
        };

        let ctx = ActorContext {
            t,
            observation,
            predictor: &self.predictor,
            model,
            stage_cost: &self.stage_cost,
            critic_features: self.critic.feature_model(),
            critic_weights: self.critic.weights(),
            safe: self.safe.as_deref(),
            perturbation: &perturbation,
        };
        self.actor.compute_action(&ctx).map_err(|e| {
            if let Error::NumericDivergence { step } = e {
                error!("prediction diverged at step {} (t = {:.3})", step, t);
            }
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Scalar;
    use crate::optimizer::EvalMode;

    // x' = u (1次元積分器)
    #[derive(Debug, Clone)]
    struct Integrator;

    impl Plant for Integrator {
        fn dim_state(&self) -> usize {
            1
        }
        fn dim_action(&self) -> usize {
            1
        }
        fn state_dyn<S: Scalar>(&self, _t: f64, _x: &[S], u: &[S], _q: &[S]) -> Vec<S> {
            vec![u[0].clone()]
        }
    }

    struct Proportional;

    impl NominalController for Proportional {
        fn compute_action(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
            y * -2.0
        }
        fn certificate<S: Scalar>(&self, y: &[S]) -> S {
            y[0].clone() * y[0].clone()
        }
    }

    // x' = 1e200 x (有限の観測から1ステップで発散する)
    #[derive(Debug, Clone)]
    struct Blowup;

    impl Plant for Blowup {
        fn dim_state(&self) -> usize {
            1
        }
        fn dim_action(&self) -> usize {
            1
        }
        fn state_dyn<S: Scalar>(&self, _t: f64, x: &[S], u: &[S], _q: &[S]) -> Vec<S> {
            vec![S::cst(1e200) * x[0].clone() + u[0].clone()]
        }
    }

    fn config(mode: ControlMode) -> Config {
        Config {
            system: "integrator".into(),
            mode,
            dt: 0.1,
            state_init: vec![1.0],
            action_manual: vec![0.5],
            action_init: vec![0.0],
            action_min: vec![-1.0],
            action_max: vec![1.0],
            n_actor: 3,
            pred_step_size: 0.1,
            r1_diag: vec![1.0, 0.1],
            r2_diag: vec![1.0, 0.1],
            buffer_size: 6,
            n_critic: 3,
            gamma: 0.9,
            critic_structure: crate::critic::CriticStructure::Quadratic,
            ..Config::default()
        }
    }

    fn controller(mode: ControlMode) -> Controller<Integrator, Proportional> {
        Controller::new(config(mode), Integrator, Some(Arc::new(Proportional))).unwrap()
    }

    #[test]
    fn zero_order_hold() {
        let mut ctrl = controller(ControlMode::Nominal);
        let y = DVector::from_element(1, 0.2);
        let u0 = ctrl.compute_action_sampled(0.0, &y).unwrap();
        assert_eq!(ctrl.tick_count(), 1);
        let held = ctrl.compute_action_sampled(0.05, &DVector::from_element(1, 0.4)).unwrap();
        assert_eq!(held, u0);
        assert_eq!(ctrl.tick_count(), 1);
        ctrl.compute_action_sampled(0.1, &y).unwrap();
        assert_eq!(ctrl.tick_count(), 2);
    }

    #[test]
    fn lifecycle() {
        let mut ctrl = controller(ControlMode::Manual);
        assert_eq!(ctrl.state(), RunState::Idle);
        let y = DVector::from_element(1, 1.0);
        ctrl.compute_action_sampled(0.0, &y).unwrap();
        assert_eq!(ctrl.state(), RunState::Running);

        ctrl.pause().unwrap();
        ctrl.compute_action_sampled(1.0, &y).unwrap();
        assert_eq!(ctrl.tick_count(), 1);
        ctrl.resume().unwrap();
        ctrl.compute_action_sampled(1.0, &y).unwrap();
        assert_eq!(ctrl.tick_count(), 2);

        ctrl.stop();
        assert!(matches!(ctrl.compute_action_sampled(2.0, &y), Err(Error::Stopped)));
        assert!(matches!(ctrl.start(), Err(Error::Stopped)));

        ctrl.reset(0.0);
        assert_eq!(ctrl.state(), RunState::Idle);
        assert!(ctrl.compute_action_sampled(0.0, &y).is_ok());
    }

    #[test]
    fn accumulated_objective_is_monotone_and_resets() {
        let mut ctrl = controller(ControlMode::Mpc);
        let mut y = DVector::from_element(1, 1.0);
        let mut prev = 0.0;
        for k in 0..8 {
            let u = ctrl.compute_action_sampled(k as f64 * 0.1, &y).unwrap();
            assert!(ctrl.accum_obj() >= prev);
            prev = ctrl.accum_obj();
            y[0] += 0.1 * u[0];
        }
        assert!(prev > 0.0);
        assert_eq!(ctrl.buffer().len(), 6);

        let weights = ctrl.critic().weights().clone();
        ctrl.reset(0.0);
        assert_eq!(ctrl.accum_obj(), 0.0);
        assert_eq!(ctrl.tick_count(), 0);
        assert!(ctrl.buffer().is_empty());
        assert_eq!(ctrl.critic().weights(), &weights);
    }

    #[test]
    fn actions_stay_in_bounds_in_every_mode() {
        for mode in [ControlMode::Manual, ControlMode::Nominal, ControlMode::Mpc, ControlMode::Rql, ControlMode::Sql] {
            let mut ctrl = controller(mode);
            let mut y = DVector::from_element(1, 3.0);
            for k in 0..6 {
                let u = ctrl.compute_action_sampled(k as f64 * 0.1, &y).unwrap();
                assert!(u[0] >= -1.0 && u[0] <= 1.0, "{}: {}", mode, u[0]);
                y[0] += 0.1 * u[0];
            }
        }
    }

    #[test]
    fn samples_pair_observation_with_held_action() {
        let mut ctrl = controller(ControlMode::Manual);
        let y0 = DVector::from_element(1, 0.7);
        ctrl.compute_action_sampled(0.0, &y0).unwrap();
        let last = ctrl.buffer().last().unwrap();
        assert_eq!(last.observation, y0);
        assert_eq!(last.action[0], 0.0);

        let y1 = DVector::from_element(1, -0.2);
        ctrl.compute_action_sampled(0.1, &y1).unwrap();
        let last = ctrl.buffer().last().unwrap();
        assert_eq!(last.observation, y1);
        assert_eq!(last.action[0], 0.5);
        assert_eq!(ctrl.buffer().len(), 2);
    }

    #[test]
    fn diverging_prediction_is_an_error() {
        for eval_mode in [EvalMode::Numeric, EvalMode::Symbolic] {
            let cfg = Config {
                eval_mode,
                ..config(ControlMode::Mpc)
            };
            let mut ctrl = Controller::new(cfg, Blowup, Some(Arc::new(Proportional))).unwrap();
            let res = ctrl.compute_action_sampled(0.0, &DVector::from_element(1, 1e200));
            assert!(
                matches!(res, Err(Error::NumericDivergence { .. })),
                "{:?}: {:?}",
                eval_mode,
                res
            );
        }
    }

    #[test]
    fn mode_checks() {
        let res = Controller::<Integrator, Proportional>::new(config(ControlMode::Nominal), Integrator, None);
        assert!(matches!(res, Err(Error::InvalidConfig(_))));

        let mut ctrl = controller(ControlMode::Rql);
        assert!(ctrl.set_mode(ControlMode::Jacs).is_err());
        ctrl.set_mode(ControlMode::Sql).unwrap();
        assert_eq!(ctrl.actor().mode(), ControlMode::Sql);
        ctrl.set_mode(ControlMode::Manual).unwrap();
        let u = ctrl.compute_action(0.0, &DVector::from_element(1, 0.0)).unwrap();
        assert_eq!(u[0], 0.5);
    }
}
