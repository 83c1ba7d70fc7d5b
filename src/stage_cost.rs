use std::str::FromStr;

use na::DVector;

use crate::backend::{lift, quad_diag, square, sub_const, vstack, Scalar};
use crate::error::{ensure_dim, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCostStructure {
    Quadratic,
    Biquadratic,
}

impl FromStr for StageCostStructure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quadratic" => Ok(Self::Quadratic),
            "biquadratic" => Ok(Self::Biquadratic),
            _ => Err(Error::InvalidConfig(format!("unknown stage cost structure: {}", s))),
        }
    }
}

/// ステージコスト
/// χ = [y - y_ref, u] として
/// quadratic:   χᵀ R1 χ
/// biquadratic: (χ²)ᵀ R2 χ² + χᵀ R1 χ
#[derive(Debug, Clone)]
pub struct StageCost {
    structure: StageCostStructure,
    r1: Vec<f64>,
    r2: Vec<f64>,
    target: Vec<f64>,
    dim_observation: usize,
    dim_action: usize,
}

impl StageCost {
    pub fn new(
        structure: StageCostStructure,
        r1_diag: &[f64],
        r2_diag: &[f64],
        observation_target: &[f64],
        dim_observation: usize,
        dim_action: usize,
    ) -> Result<Self> {
        let dim_chi = dim_observation + dim_action;
        ensure_dim("stage cost R1", dim_chi, r1_diag.len())?;
        if structure == StageCostStructure::Biquadratic {
            ensure_dim("stage cost R2", dim_chi, r2_diag.len())?;
        }
        let target = if observation_target.is_empty() {
            vec![0.0; dim_observation]
        } else {
            ensure_dim("observation target", dim_observation, observation_target.len())?;
            observation_target.to_vec()
        };
        Ok(Self {
            structure,
            r1: r1_diag.to_vec(),
            r2: r2_diag.to_vec(),
            target,
            dim_observation,
            dim_action,
        })
    }

    pub fn quadratic(r1_diag: &[f64], dim_observation: usize, dim_action: usize) -> Result<Self> {
        Self::new(StageCostStructure::Quadratic, r1_diag, &[], &[], dim_observation, dim_action)
    }

    pub fn structure(&self) -> StageCostStructure {
        self.structure
    }

    pub fn dim_observation(&self) -> usize {
        self.dim_observation
    }

    pub fn dim_action(&self) -> usize {
        self.dim_action
    }

    /// 全ての重みが非負なら半正定値
    pub fn is_psd(&self) -> bool {
        self.r1.iter().chain(&self.r2).all(|w| *w >= 0.0)
    }

    pub fn eval<S: Scalar>(&self, observation: &[S], action: &[S]) -> S {
        let chi = vstack(&sub_const(observation, &self.target), action);
        match self.structure {
            StageCostStructure::Quadratic => quad_diag(&chi, &self.r1),
            StageCostStructure::Biquadratic => {
                quad_diag(&square(&chi), &self.r2) + quad_diag(&chi, &self.r1)
            }
        }
    }

    pub fn eval_f64(&self, observation: &DVector<f64>, action: &DVector<f64>) -> f64 {
        self.eval::<f64>(
            &lift(observation.as_slice()),
            &lift(action.as_slice()),
        )
    }
}
