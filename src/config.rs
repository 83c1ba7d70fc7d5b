use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::critic::{CriticKind, CriticStructure};
use crate::error::{ensure_dim, Error, Result};
use crate::optimizer::{EvalMode, SolverSettings};
use crate::stage_cost::StageCostStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// 固定の手動入力
    Manual,
    /// 公称制御器
    Nominal,
    Mpc,
    Rql,
    Sql,
    /// 安定化付き (安全制御器の証明を使う)
    Jacs,
}

impl ControlMode {
    pub fn uses_actor(&self) -> bool {
        matches!(self, Self::Mpc | Self::Rql | Self::Sql | Self::Jacs)
    }

    pub fn critic_kind(&self) -> CriticKind {
        match self {
            Self::Jacs => CriticKind::Value,
            _ => CriticKind::ActionValue,
        }
    }
}

impl FromStr for ControlMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "nominal" => Ok(Self::Nominal),
            "MPC" => Ok(Self::Mpc),
            "RQL" => Ok(Self::Rql),
            "SQL" => Ok(Self::Sql),
            "JACS" => Ok(Self::Jacs),
            _ => Err(Error::InvalidConfig(format!("unknown control mode: {}", s))),
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Nominal => "nominal",
            Self::Mpc => "MPC",
            Self::Rql => "RQL",
            Self::Sql => "SQL",
            Self::Jacs => "JACS",
        };
        f.write_str(s)
    }
}

/// 実行設定 (周期はすべてサンプリング周期の回数)
#[derive(Debug, Clone)]
pub struct Config {
    pub system: String,
    pub mode: ControlMode,
    pub dt: f64,
    pub t1: f64,
    pub n_runs: usize,
    pub state_init: Vec<f64>,

    // モデル推定
    pub is_est_model: bool,
    pub model_est_stage: usize,
    pub model_est_period: usize,
    pub model_order: usize,
    pub model_est_checks: usize,

    // 行動
    pub prob_noise_pow: f64,
    pub action_manual: Vec<f64>,
    pub action_init: Vec<f64>,
    pub action_min: Vec<f64>,
    pub action_max: Vec<f64>,
    pub n_actor: usize,
    pub pred_step_size: f64,
    pub safe_decay_rate: f64,

    // ステージコスト
    pub stage_cost_structure: StageCostStructure,
    pub r1_diag: Vec<f64>,
    pub r2_diag: Vec<f64>,
    pub observation_target: Vec<f64>,

    // critic
    pub buffer_size: usize,
    pub n_critic: usize,
    pub gamma: f64,
    pub critic_period: usize,
    pub critic_structure: CriticStructure,
    pub critic_weight_bounds: (f64, f64),
    pub critic_weights_init: Option<Vec<f64>>,

    pub eval_mode: EvalMode,
    pub solver: SolverSettings,
    pub seed: u64,
}

impl Default for Config {
    /// 3輪ロボットのプリセット
    fn default() -> Self {
        let dt = 0.01;
        Self {
            system: "3wrobot".into(),
            mode: ControlMode::Nominal,
            dt,
            t1: 10.0,
            n_runs: 1,
            state_init: vec![5.0, 5.0, -3.0 * PI / 4.0, 0.0, 0.0],
            is_est_model: false,
            model_est_stage: 100,
            model_est_period: 1,
            model_order: 5,
            model_est_checks: 0,
            prob_noise_pow: 0.0,
            action_manual: vec![-5.0, -3.0],
            action_init: vec![0.0, 0.0],
            action_min: vec![-300.0, -100.0],
            action_max: vec![300.0, 100.0],
            n_actor: 5,
            pred_step_size: 2.0 * dt,
            safe_decay_rate: 1e-4,
            stage_cost_structure: StageCostStructure::Quadratic,
            r1_diag: vec![1.0, 10.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            r2_diag: vec![1.0, 10.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            observation_target: vec![],
            buffer_size: 10,
            n_critic: 4,
            gamma: 1.0,
            critic_period: 1,
            critic_structure: CriticStructure::QuadNoMix,
            critic_weight_bounds: (-1e3, 1e3),
            critic_weights_init: None,
            eval_mode: EvalMode::Symbolic,
            solver: SolverSettings::default(),
            seed: 0,
        }
    }
}

impl Config {
    pub fn critic_kind(&self) -> CriticKind {
        self.mode.critic_kind()
    }

    /// 最初のティックより前に矛盾した設定を弾く
    pub fn validate(&self, dim_observation: usize, dim_action: usize) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.into()));

        if !(self.dt > 0.0) {
            return invalid("sampling time must be positive");
        }
        if !(self.pred_step_size > 0.0) {
            return invalid("prediction step size must be positive");
        }
        if self.n_actor == 0 {
            return invalid("actor horizon must be positive");
        }
        if self.buffer_size == 0 {
            return invalid("buffer size must be positive");
        }
        if self.n_critic < 2 || self.n_critic > self.buffer_size {
            return invalid("critic stack must be between 2 and the buffer size");
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return invalid("discount factor must lie in (0, 1]");
        }
        if self.critic_period == 0 || self.model_est_period == 0 {
            return invalid("periods must be at least one tick");
        }
        if self.model_order == 0 {
            return invalid("model order must be positive");
        }
        if self.is_est_model && self.buffer_size < self.model_order + 1 {
            return invalid("buffer too small for the model order");
        }
        if self.prob_noise_pow < 0.0 {
            return invalid("probing noise power must be non-negative");
        }
        let (w_min, w_max) = self.critic_weight_bounds;
        if w_min > w_max {
            return invalid("critic weight bounds are inverted");
        }

        ensure_dim("action lower bound", dim_action, self.action_min.len())?;
        ensure_dim("action upper bound", dim_action, self.action_max.len())?;
        ensure_dim("initial action", dim_action, self.action_init.len())?;
        ensure_dim("manual action", dim_action, self.action_manual.len())?;
        if self.action_min.iter().zip(&self.action_max).any(|(l, u)| l > u) {
            return invalid("action lower bound exceeds upper bound");
        }

        let dim_chi = dim_observation + dim_action;
        ensure_dim("stage cost R1", dim_chi, self.r1_diag.len())?;
        if self.stage_cost_structure == StageCostStructure::Biquadratic {
            ensure_dim("stage cost R2", dim_chi, self.r2_diag.len())?;
        }
        if !self.observation_target.is_empty() {
            ensure_dim("observation target", dim_observation, self.observation_target.len())?;
        }
        if self.critic_kind() == CriticKind::Value
            && self.critic_structure == CriticStructure::QuadMix
        {
            return invalid("quad-mix features need an action-value critic");
        }
        Ok(())
    }
}
