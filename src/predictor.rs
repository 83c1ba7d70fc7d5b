use na::DVector;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::backend::{lift, Scalar};
use crate::error::{ensure_dim, Error, Result};
use crate::model::ModelSs;
use crate::plant::Plant;

/// 予測に使う右辺
#[derive(Debug, Clone, Copy)]
pub enum PredictionModel<'a> {
    /// 真のプラント右辺をオイラー法で積分
    Plant,
    /// 推定した離散時間モデル (1ステップ = サンプリング周期)
    Surrogate {
        model: &'a ModelSs,
        state: &'a DVector<f64>,
    },
}

/// 探索ノイズ (分散 pow, ±3σ で打ち切り)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbingNoise {
    pub pow: f64,
    pub seed: u64,
}

impl ProbingNoise {
    pub fn new(pow: f64, seed: u64) -> Self {
        Self { pow, seed }
    }

    pub fn is_active(&self) -> bool {
        self.pow > 0.0
    }

    pub fn sample(&self, n_steps: usize, dim_action: usize) -> Vec<Vec<f64>> {
        let std_dev = self.pow.max(0.0).sqrt();
        let dist = match Normal::new(0.0, std_dev) {
            Ok(dist) if std_dev > 0.0 => dist,
            _ => return vec![vec![0.0; dim_action]; n_steps],
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let limit = 3.0 * std_dev;
        (0..n_steps)
            .map(|_| {
                (0..dim_action)
                    .map(|_| dist.sample(&mut rng).clamp(-limit, limit))
                    .collect()
            })
            .collect()
    }
}

/// 予測軌道
/// observations[0] は現在の観測、observations[k+1] は actions[k] を加えた後の予測
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory<S> {
    pub observations: Vec<Vec<S>>,
    pub actions: Vec<Vec<S>>,
}

impl<S> Trajectory<S> {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn pair(&self, k: usize) -> (&[S], &[S]) {
        (&self.observations[k], &self.actions[k])
    }

    pub fn terminal(&self) -> &[S] {
        &self.observations[self.actions.len()]
    }
}

impl Trajectory<f64> {
    pub fn check_finite(&self) -> Result<()> {
        for (step, y) in self.observations.iter().enumerate() {
            if y.iter().any(|e| !e.is_finite()) {
                return Err(Error::NumericDivergence { step });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StatePredictor<P: Plant> {
    plant: P,
    pred_step_size: f64,
    n_steps: usize,
}

impl<P: Plant> StatePredictor<P> {
    pub fn new(plant: P, pred_step_size: f64, n_steps: usize) -> Result<Self> {
        if !(pred_step_size > 0.0) {
            return Err(Error::InvalidConfig("prediction step size must be positive".into()));
        }
        if n_steps == 0 {
            return Err(Error::InvalidConfig("prediction horizon must be positive".into()));
        }
        // 観測をそのまま状態として積分する
        ensure_dim("observation used as plant state", plant.dim_state(), plant.dim_observation())?;
        Ok(Self {
            plant,
            pred_step_size,
            n_steps,
        })
    }

    pub fn plant(&self) -> &P {
        &self.plant
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn pred_step_size(&self) -> f64 {
        self.pred_step_size
    }

    /// 行動列 actions (n_steps 行) に対する予測軌道
    /// perturbation は積分にだけ加え、軌道に記録する行動は元の候補列
    pub fn predict<S: Scalar>(
        &self,
        t: f64,
        observation: &[f64],
        actions: &[Vec<S>],
        model: &PredictionModel,
        perturbation: &[Vec<f64>],
    ) -> Trajectory<S> {
        let mut observations = Vec::with_capacity(actions.len() + 1);
        observations.push(lift::<S>(observation));

        match model {
            PredictionModel::Plant => {
                let h = self.pred_step_size;
                let mut x: Vec<S> = lift(observation);
                for (k, u) in actions.iter().enumerate() {
                    let u = perturb(u, perturbation.get(k));
                    let dx = self.plant.state_dyn(t + k as f64 * h, &x, &u, &[]);
                    x = x
                        .into_iter()
                        .zip(dx)
                        .map(|(x, dx)| x + S::cst(h) * dx)
                        .collect();
                    observations.push(self.plant.output(&x));
                }
            }
            PredictionModel::Surrogate { model, state } => {
                let mut z: Vec<S> = lift(state.as_slice());
                for (k, u) in actions.iter().enumerate() {
                    let u = perturb(u, perturbation.get(k));
                    z = model.step(&z, &u);
                    observations.push(model.output(&z, &u));
                }
            }
        }

        Trajectory {
            observations,
            actions: actions.to_vec(),
        }
    }

    pub fn predict_with_noise<S: Scalar>(
        &self,
        t: f64,
        observation: &[f64],
        actions: &[Vec<S>],
        model: &PredictionModel,
        noise: &ProbingNoise,
    ) -> Trajectory<S> {
        let dim_action = actions.first().map_or(0, |u| u.len());
        let perturbation = noise.sample(actions.len(), dim_action);
        self.predict(t, observation, actions, model, &perturbation)
    }
}

fn perturb<S: Scalar>(u: &[S], noise: Option<&Vec<f64>>) -> Vec<S> {
    match noise {
        Some(n) => u
            .iter()
            .zip(n)
            .map(|(u, n)| if *n == 0.0 { u.clone() } else { u.clone() + S::cst(*n) })
            .collect(),
        None => u.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na::DMatrix;

    // x' = -x + u
    #[derive(Debug, Clone)]
    struct Decay;

    impl Plant for Decay {
        fn dim_state(&self) -> usize {
            1
        }
        fn dim_action(&self) -> usize {
            1
        }
        fn state_dyn<S: Scalar>(&self, _t: f64, x: &[S], u: &[S], _q: &[S]) -> Vec<S> {
            vec![-x[0].clone() + u[0].clone()]
        }
    }

    #[test]
    fn euler_rollout() {
        let pred = StatePredictor::new(Decay, 0.1, 2).unwrap();
        let actions = vec![vec![1.0], vec![0.0]];
        let traj = pred.predict(0.0, &[1.0], &actions, &PredictionModel::Plant, &[]);
        assert_eq!(traj.len(), 2);
        assert_eq!(traj.observations[0], vec![1.0]);
        assert!((traj.observations[1][0] - 1.0).abs() < 1e-15);
        assert!((traj.terminal()[0] - 0.9).abs() < 1e-15);
    }

    #[test]
    fn identical_inputs_give_identical_trajectories() {
        let pred = StatePredictor::new(Decay, 0.05, 5).unwrap();
        let actions: Vec<Vec<f64>> = (0..5).map(|k| vec![k as f64 * 0.3 - 0.5]).collect();
        let noise = ProbingNoise::new(0.2, 42);
        let a = pred.predict_with_noise(0.0, &[0.7], &actions, &PredictionModel::Plant, &noise);
        let b = pred.predict_with_noise(0.0, &[0.7], &actions, &PredictionModel::Plant, &noise);
        assert_eq!(a, b);
        for (ya, yb) in a.observations.iter().zip(&b.observations) {
            assert_eq!(ya[0].to_bits(), yb[0].to_bits());
        }

        let c = pred.predict_with_noise(0.0, &[0.7], &actions, &PredictionModel::Plant, &ProbingNoise::new(0.2, 43));
        assert_ne!(a.observations, c.observations);
        // 記録される行動は候補列のまま
        assert_eq!(a.actions, actions);
    }

    #[test]
    fn noise_is_bounded() {
        let noise = ProbingNoise::new(1.0, 7).sample(200, 2);
        assert!(noise.iter().flatten().all(|e| e.abs() <= 3.0));
        let silent = ProbingNoise::new(0.0, 7).sample(3, 2);
        assert!(silent.iter().flatten().all(|e| *e == 0.0));
    }

    #[test]
    fn surrogate_rollout_and_divergence() {
        let model = ModelSs::new(
            DMatrix::from_element(1, 1, 1e200),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::zeros(1, 1),
            DVector::zeros(1),
        )
        .unwrap();
        let state = DVector::from_element(1, 1e200);
        let pred = StatePredictor::new(Decay, 0.1, 2).unwrap();
        let actions = vec![vec![0.0]; 2];
        let traj = pred.predict(0.0, &[1.0], &actions, &PredictionModel::Surrogate { model: &model, state: &state }, &[]);
        assert!(matches!(traj.check_finite(), Err(Error::NumericDivergence { step: 1 })));
    }
}
