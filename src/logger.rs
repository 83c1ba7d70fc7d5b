use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::config::Config;
use crate::controller::TickRecord;
use crate::error::Result;

/// 1実行ごとに1ファイルの CSV ログ
/// メタデータ行、ヘッダ行、ティックごとのデータ行の順に書く
pub struct CsvLogger {
    wtr: csv::Writer<File>,
    path: PathBuf,
    rows: usize,
}

impl CsvLogger {
    /// <system>__<mode>__<date>__<time>__runNN.csv
    pub fn file_name(config: &Config, run: usize) -> String {
        let now = Local::now();
        format!(
            "{}__{}__{}__{}__run{:02}.csv",
            config.system,
            config.mode,
            now.format("%Y-%m-%d"),
            now.format("%Hh%Mm%Ss"),
            run
        )
    }

    pub fn create(dir: impl AsRef<Path>, config: &Config, run: usize, dim_obs: usize, dim_act: usize) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(Self::file_name(config, run));
        // メタデータ行は列数が揃わない
        let wtr = csv::WriterBuilder::new().flexible(true).from_path(&path)?;
        let mut logger = Self { wtr, path, rows: 0 };
        logger.write_metadata(config)?;
        logger.write_header(dim_obs, dim_act)?;
        info!("logging to {}", logger.path.display());
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    fn write_metadata(&mut self, config: &Config) -> Result<()> {
        let join = |v: &[f64]| v.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" ");
        let rows = [
            ("System", config.system.clone()),
            ("Controller", config.mode.to_string()),
            ("dt", config.dt.to_string()),
            ("state_init", join(&config.state_init)),
            ("is_est_model", config.is_est_model.to_string()),
            ("model_est_stage", config.model_est_stage.to_string()),
            ("model_est_period", config.model_est_period.to_string()),
            ("model_order", config.model_order.to_string()),
            ("prob_noise_pow", config.prob_noise_pow.to_string()),
            ("Nactor", config.n_actor.to_string()),
            ("pred_step_size", config.pred_step_size.to_string()),
            ("buffer_size", config.buffer_size.to_string()),
            ("stage_obj_struct", format!("{:?}", config.stage_cost_structure)),
            ("R1_diag", join(&config.r1_diag)),
            ("R2_diag", join(&config.r2_diag)),
            ("Ncritic", config.n_critic.to_string()),
            ("gamma", config.gamma.to_string()),
            ("critic_period", config.critic_period.to_string()),
            ("critic_struct", format!("{:?}", config.critic_structure)),
        ];
        for (key, value) in rows {
            self.wtr.write_record([key, value.as_str()])?;
        }
        Ok(())
    }

    fn write_header(&mut self, dim_obs: usize, dim_act: usize) -> Result<()> {
        let mut header = vec!["t [s]".to_string()];
        header.extend((0..dim_obs).map(|i| format!("y{}", i)));
        header.push("stage cost".into());
        header.push("accum obj".into());
        header.extend((0..dim_act).map(|i| format!("u{}", i)));
        self.wtr.write_record(&header)?;
        Ok(())
    }

    pub fn write(&mut self, record: &TickRecord) -> Result<()> {
        let mut row = vec![record.t.to_string()];
        row.extend(record.observation.iter().map(|e| e.to_string()));
        row.push(record.stage_cost.to_string());
        row.push(record.accum_obj.to_string());
        row.extend(record.action.iter().map(|e| e.to_string()));
        self.wtr.write_record(&row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na::DVector;

    #[test]
    fn writes_metadata_header_and_rows() {
        let dir = std::env::temp_dir().join(format!("rlmpc-log-{}", std::process::id()));
        let cfg = Config::default();
        let mut logger = CsvLogger::create(&dir, &cfg, 1, 2, 1).unwrap();
        let name = logger.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("3wrobot__nominal__"));
        assert!(name.ends_with("__run01.csv"));

        let record = TickRecord {
            t: 0.5,
            observation: DVector::from_vec(vec![1.0, 2.0]),
            stage_cost: 3.0,
            accum_obj: 4.0,
            action: DVector::from_vec(vec![-1.0]),
        };
        logger.write(&record).unwrap();
        logger.flush().unwrap();
        assert_eq!(logger.rows(), 1);

        let text = std::fs::read_to_string(logger.path()).unwrap();
        assert!(text.contains("t [s],y0,y1,stage cost,accum obj,u0"));
        assert!(text.lines().last().unwrap().starts_with("0.5,1,2,3,4,-1"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
