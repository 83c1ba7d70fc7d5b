use na::DVector;

use crate::backend::Scalar;

/// 制御対象 (連続時間)
/// 右辺 f(t, x, u, q) と出力写像 h(x) だけを外部に公開する
pub trait Plant: Clone + Send + Sync {
    fn dim_state(&self) -> usize;
    fn dim_action(&self) -> usize;

    fn dim_observation(&self) -> usize {
        self.dim_state()
    }

    fn dim_disturbance(&self) -> usize {
        0
    }

    fn state_dyn<S: Scalar>(&self, t: f64, state: &[S], action: &[S], disturbance: &[S]) -> Vec<S>;

    fn output<S: Scalar>(&self, state: &[S]) -> Vec<S> {
        state.to_vec()
    }
}

/// 公称(安全)制御器
/// 呼び出し側からは読み取り専用で使う
pub trait NominalController: Send + Sync {
    fn compute_action(&self, t: f64, observation: &DVector<f64>) -> DVector<f64>;

    /// リアプノフ関数などの減衰証明
    fn certificate<S: Scalar>(&self, observation: &[S]) -> S;
}
