extern crate nalgebra as na;
use log::{info, LevelFilter};
use na::DVector;
use rlmpc::backend::Scalar;
use rlmpc::logger::CsvLogger;
use rlmpc::{Config, ControlMode, Controller, NominalController, Plant, Simulator};
use simple_logger::SimpleLogger;
use std::sync::Arc;

// 物理パラメータ
const M: f64 = 10.0; // [kg]
const I: f64 = 1.0; // [kg m^2]

// 公称制御器のゲイン
const GAIN: f64 = 5.0;

// 積分の最大刻み
const MAX_STEP: f64 = 1e-3;
const LOG_DIR: &str = "logs";

/// 3輪ロボット (力とトルク入力)
/// x = [x, y, α, v, ω], u = [F, M]
#[derive(Debug, Clone)]
struct Sys3WRobot {
    m: f64,
    i: f64,
}

impl Plant for Sys3WRobot {
    fn dim_state(&self) -> usize {
        5
    }

    fn dim_action(&self) -> usize {
        2
    }

    fn state_dyn<S: Scalar>(&self, _t: f64, x: &[S], u: &[S], _q: &[S]) -> Vec<S> {
        vec![
            x[3].clone() * x[2].cos(),
            x[3].clone() * x[2].sin(),
            x[4].clone(),
            u[0].clone() / S::cst(self.m),
            u[1].clone() / S::cst(self.i),
        ]
    }
}

/// 原点へ向かう運動学則 + 速度の比例制御
struct CtrlNominal3WRobot {
    m: f64,
    i: f64,
    gain: f64,
    bounds: ([f64; 2], [f64; 2]),
}

impl NominalController for CtrlNominal3WRobot {
    fn compute_action(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        let (px, py, alpha, v, omega) = (y[0], y[1], y[2], y[3], y[4]);
        let v_ref = -(px * alpha.cos() + py * alpha.sin());
        let heading = (-py).atan2(-px);
        let mut err = alpha - heading;
        // [-π, π) に折り返す
        err = (err + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI) - std::f64::consts::PI;
        let omega_ref = -err;
        let f = self.m * self.gain * (v_ref - v);
        let torque = self.i * self.gain * (omega_ref - omega);
        let (lo, hi) = self.bounds;
        DVector::from_vec(vec![f.clamp(lo[0], hi[0]), torque.clamp(lo[1], hi[1])])
    }

    fn certificate<S: Scalar>(&self, y: &[S]) -> S {
        let pos = y[0].clone() * y[0].clone() + y[1].clone() * y[1].clone();
        let vel = y[3].clone() * y[3].clone() + y[4].clone() * y[4].clone();
        S::cst(0.5) * pos + S::cst(0.5 / self.gain) * vel
    }
}

fn main() -> anyhow::Result<()> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;

    let mut config = Config::default();
    if let Some(mode) = std::env::args().nth(1) {
        config.mode = mode.parse::<ControlMode>()?;
    }
    if let Some(n) = std::env::args().nth(2) {
        config.n_runs = n.parse()?;
    }

    let robot = Sys3WRobot { m: M, i: I };
    let nominal = Arc::new(CtrlNominal3WRobot {
        m: M,
        i: I,
        gain: GAIN,
        bounds: (
            [config.action_min[0], config.action_min[1]],
            [config.action_max[0], config.action_max[1]],
        ),
    });

    let state_init = DVector::from_column_slice(&config.state_init);
    let mut sim = Simulator::new(robot.clone(), state_init, 0.0, config.dt, MAX_STEP)?;
    let mut ctrl = Controller::new(config.clone(), robot, Some(nominal))?;

    let n_steps = (config.t1 / config.dt).round() as usize;
    for run in 1..=config.n_runs {
        let mut logger = CsvLogger::create(LOG_DIR, &config, run, 5, 2)?;
        for _ in 0..n_steps {
            let (t, x, y) = sim.get_sim_step_data();
            let u = ctrl.compute_action_sampled(t, &y)?;
            sim.receive_action(&u)?;
            sim.sim_step()?;
            logger.write(&ctrl.record())?;

            if ctrl.tick_count() % 100 == 0 {
                print!("\x1b[36mRun {:02}: \x1b[m", run);
                print!("t: {:5.2} ", t);
                print!("x: [{:6.2}, {:6.2}, {:6.2}] ", x[0], x[1], x[2]);
                print!("u: [{:7.2}, {:7.2}] ", u[0], u[1]);
                println!("J: {:.3e}", ctrl.accum_obj());
            }
        }
        logger.flush()?;
        info!(
            "run {} finished: accumulated objective {:.4e}, log {}",
            run,
            ctrl.accum_obj(),
            logger.path().display()
        );

        sim.reset();
        ctrl.reset(0.0);
    }
    ctrl.stop();

    Ok(())
}
