/// Command line entry point: wires the pipeline stages (fetch, build-features, freeze, train)
/// and the two prediction front ends together
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod config;
mod error;
mod features;
mod fetch;
mod freeze;
mod io;
mod model;
mod predict;
mod train;
mod ui;

use config::Config;

#[derive(Parser)]
#[command(name = "gridiron")]
#[command(about = "NFL home-win probability pipeline", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download play-by-play and team-week parquet files
    Fetch {
        /// First season
        #[arg(long)]
        start: i32,
        /// Last season, inclusive
        #[arg(long)]
        end: i32,
    },
    /// Build artifacts/features.parquet from the downloaded seasons
    BuildFeatures,
    /// Freeze the differential columns into the named dataset
    Freeze,
    /// Tune, train and save the classifier
    Train,
    /// Print the home-win probability for a matchup
    Predict {
        #[arg(long)]
        home: String,
        #[arg(long)]
        away: String,
        #[arg(long, requires = "week")]
        season: Option<i32>,
        #[arg(long, requires = "season")]
        week: Option<i32>,
    },
    /// fetch -> build-features -> freeze -> train
    Update,
    /// Interactive terminal predictor
    Ui,
}

/// Runs the four batch stages in order; the first failing stage aborts the rest.
/// input: loaded configuration
/// output: Ok once the model is saved
fn update(config: &Config) -> anyhow::Result<()> {
    fetch::run(config, config.start_season, config.end_season).context("fetch stage failed")?;
    features::run(config).context("build-features stage failed")?;
    freeze::run(config).context("freeze stage failed")?;
    train::run(config).context("train stage failed")?;
    println!("Update complete.");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Fetch { start, end } => {
            fetch::run(&config, start, end).context("fetch stage failed")?;
        }
        Commands::BuildFeatures => {
            features::run(&config).context("build-features stage failed")?;
        }
        Commands::Freeze => {
            freeze::run(&config).context("freeze stage failed")?;
        }
        Commands::Train => {
            train::run(&config).context("train stage failed")?;
        }
        Commands::Predict { home, away, season, week } => {
            predict::run_cli(&config, &home, &away, season, week).context("prediction failed")?;
        }
        Commands::Update => update(&config)?,
        Commands::Ui => ui::run(&config).context("terminal UI failed")?,
    }
    Ok(())
}

/// the end-to-end test over the whole offline pipeline
#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    use crate::io::fixtures::{temp_dir, write_plays, write_team_weeks};
    use crate::model::{BoostParams, GradientBoostedClassifier};
    use crate::predict::{MatchupQuery, Prediction};

    #[test]
    fn test_cli_parses_predict_and_global_config() {
        let cli = Cli::parse_from([
            "gridiron", "predict", "--home", "DAL", "--away", "PHI", "--season", "2024", "--week", "5",
            "--config", "other.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        match cli.command {
            Commands::Predict { home, away, season, week } => {
                assert_eq!((home.as_str(), away.as_str()), ("DAL", "PHI"));
                assert_eq!((season, week), (Some(2024), Some(5)));
            }
            _ => panic!("expected predict"),
        }
        // season without week is rejected
        assert!(Cli::try_parse_from(["gridiron", "predict", "--home", "A", "--away", "B", "--season", "2024"]).is_err());
    }

    #[test]
    fn test_fetch_requires_season_range() {
        assert!(Cli::try_parse_from(["gridiron", "fetch"]).is_err());
        assert!(Cli::try_parse_from(["gridiron", "fetch", "--start", "2023"]).is_err());
        let cli = Cli::parse_from(["gridiron", "fetch", "--start", "2023", "--end", "2024"]);
        match cli.command {
            Commands::Fetch { start, end } => assert_eq!((start, end), (2023, 2024)),
            _ => panic!("expected fetch"),
        }
    }

    /// UPDATE: a failing fetch stops the run before any later stage writes output
    #[test]
    fn test_update_stops_at_first_failing_stage() {
        let dir = temp_dir("update_stops");
        let config = Config {
            start_season: 2025,
            end_season: 2023,
            data_dir: dir.join("data"),
            artifacts_dir: dir.join("artifacts"),
            models_dir: dir.join("models"),
            ..Config::default()
        };

        let err = update(&config).unwrap_err();
        assert!(err.to_string().contains("fetch"));
        assert!(!config.features_path().exists());
        assert!(!config.dataset_path("parquet").exists());
        assert!(!config.model_path().exists());
    }

    /// PIPELINE: two seasons of AAA/BBB games through features, freeze, fit and lookup
    #[test]
    fn test_offline_pipeline_end_to_end() -> Result<(), Box<dyn Error>> {
        let dir = temp_dir("end_to_end");
        let config = Config {
            start_season: 2023,
            end_season: 2024,
            data_dir: dir.join("data"),
            artifacts_dir: dir.join("artifacts"),
            models_dir: dir.join("models"),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.data_dir)?;

        write_plays(
            &config.play_by_play_path(2023),
            &[
                ("g1", 2023, 1, "AAA", "BBB", Some(0.3), Some(8.0), 7, 3),
                ("g1", 2023, 1, "AAA", "BBB", Some(-0.1), Some(2.0), 24, 17),
                ("g2", 2023, 2, "BBB", "AAA", Some(0.2), Some(5.0), 7, 7),
                ("g2", 2023, 2, "BBB", "AAA", None, Some(1.0), 14, 14),
            ],
        )?;
        write_plays(
            &config.play_by_play_path(2024),
            &[
                ("g3", 2024, 1, "AAA", "BBB", Some(-0.4), Some(3.0), 10, 20),
                ("g3", 2024, 1, "AAA", "BBB", Some(0.1), None, 10, 20),
            ],
        )?;
        write_team_weeks(
            &config.team_week_path(2023),
            &[(2023, 1, "AAA", Some(0.5)), (2023, 1, "BBB", Some(-0.2)), (2023, 2, "AAA", None)],
        )?;
        write_team_weeks(&config.team_week_path(2024), &[(2024, 1, "BBB", Some(0.1))])?;

        let features = features::run(&config)?;
        assert_eq!(features.rows.len(), 3);
        let labels: Vec<i32> = features.rows.iter().map(|r| r.result).collect();
        assert_eq!(labels, vec![1, 0, 0]);

        let dataset = freeze::run(&config)?;
        assert!(!dataset.columns.is_empty());
        assert!(dataset.columns.iter().all(|c| c.ends_with("_diff")));
        assert!(config.dataset_path("csv").exists());

        let (x, y) = train::design_matrix(&dataset);
        let params = BoostParams { n_estimators: 5, ..BoostParams::default() };
        let model = GradientBoostedClassifier::fit(x.view(), y.view(), dataset.columns.clone(), params)?;
        model.save(&config.model_path())?;
        let model = GradientBoostedClassifier::load(&config.model_path())?;

        let table = crate::io::load_feature_table(&config.features_path())?;
        let query = |home: &str, away: &str| MatchupQuery {
            home_team: home.to_string(),
            away_team: away.to_string(),
            season: 2023,
            week: 1,
        };
        match predict::predict_matchup(&model, &table, &query("AAA", "BBB"))? {
            Prediction::Found { probability, .. } => assert!((0.0..=1.0).contains(&probability)),
            Prediction::NotFound => panic!("AAA vs BBB was scheduled"),
        }
        assert_eq!(
            predict::predict_matchup(&model, &table, &query("AAA", "CCC"))?,
            Prediction::NotFound
        );

        let p = predict::predict_teams(&model, &table, "BBB", "AAA")?;
        assert!((0.0..=1.0).contains(&p));
        Ok(())
    }
}
