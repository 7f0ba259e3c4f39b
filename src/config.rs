// Pipeline configuration, loaded once from config.toml and handed to every stage.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Release mirror that publishes one parquet file per season.
pub const DEFAULT_BASE_URL: &str = "https://github.com/nflverse/nflverse-data/releases/download";

/// Play columns kept when loading play-by-play files.
/// Text columns in this list (e.g. `play_type`) are dropped by the numeric filter anyway.
const DEFAULT_PLAY_COLUMNS: [&str; 18] = [
    "pass", "rush", "play_type", "epa", "success", "qb_hit", "sack", "interception",
    "touchdown", "fumble_lost", "air_yards", "yards_gained", "yardline_100", "down",
    "ydstogo", "home_score", "away_score", "defteam",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base name of the frozen dataset files.
    pub dataset_name: String,
    pub start_season: i32,
    pub end_season: i32,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub models_dir: PathBuf,
    pub base_url: String,
    /// Play columns to keep; empty keeps every numeric column.
    pub play_columns: Vec<String>,
    pub train: TrainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_name: "dataset_export".to_string(),
            start_season: 2023,
            end_season: 2025,
            data_dir: PathBuf::from("data"),
            artifacts_dir: PathBuf::from("artifacts"),
            models_dir: PathBuf::from("models"),
            base_url: DEFAULT_BASE_URL.to_string(),
            play_columns: DEFAULT_PLAY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            train: TrainConfig::default(),
        }
    }
}

/// Hyperparameter grid and evaluation settings for the train stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    pub max_depth: Vec<usize>,
    pub learning_rate: Vec<f64>,
    pub n_estimators: Vec<usize>,
    pub subsample: Vec<f64>,
    pub colsample_bytree: Vec<f64>,
    pub cv_folds: usize,
    pub test_ratio: f32,
    pub seed: u64,
    /// How many features the importance chart shows.
    pub plot_top: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_depth: vec![3, 5, 7],
            learning_rate: vec![0.05, 0.1, 0.2],
            n_estimators: vec![100, 300],
            subsample: vec![0.8, 1.0],
            colsample_bytree: vec![0.8, 1.0],
            cv_folds: 3,
            test_ratio: 0.2,
            seed: 42,
            plot_top: 20,
        }
    }
}

impl Config {
    /// Reads `path` as TOML; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            println!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn seasons(&self) -> Vec<i32> {
        (self.start_season..=self.end_season).collect()
    }

    pub fn play_by_play_path(&self, season: i32) -> PathBuf {
        self.data_dir.join(format!("play_by_play_{season}.parquet"))
    }

    pub fn team_week_path(&self, season: i32) -> PathBuf {
        self.data_dir.join(format!("stats_team_week_{season}.parquet"))
    }

    pub fn features_path(&self) -> PathBuf {
        self.artifacts_dir.join("features.parquet")
    }

    /// Frozen dataset path with the given extension (`parquet` or `csv`).
    pub fn dataset_path(&self, ext: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{}.{ext}", self.dataset_name))
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join("model.json")
    }

    pub fn importance_plot_path(&self) -> PathBuf {
        self.artifacts_dir.join("feature_importance.png")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_partial_config_keeps_defaults() -> std::result::Result<(), Box<dyn Error>> {
        let cfg: Config = toml::from_str(
            "dataset_name = \"wk10\"\nstart_season = 2022\n\n[train]\nmax_depth = [2]\n",
        )?;
        assert_eq!(cfg.dataset_name, "wk10");
        assert_eq!(cfg.start_season, 2022);
        assert_eq!(cfg.end_season, 2025);
        assert_eq!(cfg.train.max_depth, vec![2]);
        assert_eq!(cfg.train.cv_folds, 3);
        assert_eq!(cfg.seasons(), vec![2022, 2023, 2024, 2025]);
        assert_eq!(cfg.dataset_path("csv"), PathBuf::from("artifacts/wk10.csv"));
        Ok(())
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() -> std::result::Result<(), Box<dyn Error>> {
        let cfg = Config::load(Path::new("definitely/not/here/config.toml"))?;
        assert_eq!(cfg, Config::default());
        assert_eq!(
            cfg.play_by_play_path(2024),
            PathBuf::from("data/play_by_play_2024.parquet")
        );
        Ok(())
    }
}
