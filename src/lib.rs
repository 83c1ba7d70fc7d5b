extern crate nalgebra as na;

pub mod actor;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod critic;
pub mod error;
pub mod estimator;
pub mod logger;
pub mod model;
pub mod optimizer;
pub mod plant;
pub mod predictor;
pub mod simulator;
pub mod stage_cost;

pub use actor::Actor;
pub use buffer::{ExperienceBuffer, Sample};
pub use config::{Config, ControlMode};
pub use controller::{Controller, RunState, TickRecord};
pub use critic::{Critic, CriticKind, CriticStructure};
pub use error::{Error, Result};
pub use estimator::ModelEstimator;
pub use model::ModelSs;
pub use optimizer::{Bounds, EvalMode, Optimizer, SolverSettings};
pub use plant::{NominalController, Plant};
pub use predictor::{PredictionModel, ProbingNoise, StatePredictor, Trajectory};
pub use simulator::Simulator;
pub use stage_cost::{StageCost, StageCostStructure};
