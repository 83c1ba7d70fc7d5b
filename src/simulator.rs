use na::DVector;

use crate::error::{ensure_dim, Error, Result};
use crate::plant::Plant;

/// 真のプラントを積分するシミュレータ
/// 受け取った行動を次の受信までホールドする
#[derive(Debug, Clone)]
pub struct Simulator<P: Plant> {
    plant: P,
    dt: f64,
    max_step: f64,
    t0: f64,
    t: f64,
    state_init: DVector<f64>,
    state: DVector<f64>,
    action: DVector<f64>,
    disturbance: Vec<f64>,
}

impl<P: Plant> Simulator<P> {
    pub fn new(plant: P, state_init: DVector<f64>, t0: f64, dt: f64, max_step: f64) -> Result<Self> {
        ensure_dim("initial state", plant.dim_state(), state_init.len())?;
        if !(dt > 0.0 && max_step > 0.0) {
            return Err(Error::InvalidConfig("simulation steps must be positive".into()));
        }
        Ok(Self {
            dt,
            max_step,
            t0,
            t: t0,
            state: state_init.clone(),
            state_init,
            action: DVector::zeros(plant.dim_action()),
            disturbance: vec![0.0; plant.dim_disturbance()],
            plant,
        })
    }

    pub fn plant(&self) -> &P {
        &self.plant
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn receive_action(&mut self, action: &DVector<f64>) -> Result<()> {
        ensure_dim("simulator action", self.plant.dim_action(), action.len())?;
        self.action.copy_from(action);
        Ok(())
    }

    /// dt だけ進める (max_step 以下の刻みでオイラー積分)
    pub fn sim_step(&mut self) -> Result<()> {
        let n_sub = (self.dt / self.max_step).ceil().max(1.0) as usize;
        let h = self.dt / n_sub as f64;
        for i in 0..n_sub {
            let t = self.t + i as f64 * h;
            let dx = self.plant.state_dyn(
                t,
                self.state.as_slice(),
                self.action.as_slice(),
                &self.disturbance,
            );
            for (x, dx) in self.state.iter_mut().zip(dx) {
                *x += h * dx;
            }
        }
        self.t += self.dt;
        if self.state.iter().any(|e| !e.is_finite()) {
            return Err(Error::NumericDivergence { step: 0 });
        }
        Ok(())
    }

    /// (時刻, 状態, 観測)
    pub fn get_sim_step_data(&self) -> (f64, DVector<f64>, DVector<f64>) {
        let observation = self.plant.output(self.state.as_slice());
        (self.t, self.state.clone(), DVector::from_vec(observation))
    }

    pub fn reset(&mut self) {
        self.t = self.t0;
        self.state.copy_from(&self.state_init);
        self.action.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Scalar;

    // x' = u
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

    #[test]
    fn holds_action_between_steps() {
        let mut sim = Simulator::new(Integrator, DVector::from_element(1, 0.0), 0.0, 0.1, 0.01).unwrap();
        sim.receive_action(&DVector::from_element(1, 2.0)).unwrap();
        sim.sim_step().unwrap();
        sim.sim_step().unwrap();
        let (t, x, y) = sim.get_sim_step_data();
        assert!((t - 0.2).abs() < 1e-12);
        assert!((x[0] - 0.4).abs() < 1e-12);
        assert_eq!(x, y);

        sim.reset();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.get_sim_step_data().1[0], 0.0);
        assert!(sim.receive_action(&DVector::zeros(2)).is_err());
    }
}
