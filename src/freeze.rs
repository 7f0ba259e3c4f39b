// Freezes the labelled differential columns into a named dataset snapshot for training.
use std::fs;

use crate::config::Config;
use crate::error::Result;
use crate::io::{self, FeatureTable};

pub fn is_diff_column(name: &str) -> bool {
    name.ends_with("_diff")
}

/// Keeps identifiers, the label, and every differential column.
pub fn select_dataset(features: &FeatureTable) -> FeatureTable {
    let keep: Vec<usize> = features
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| is_diff_column(name))
        .map(|(idx, _)| idx)
        .collect();

    FeatureTable {
        columns: keep.iter().map(|&idx| features.columns[idx].clone()).collect(),
        rows: features
            .rows
            .iter()
            .map(|row| {
                let mut frozen = row.clone();
                frozen.values = keep.iter().map(|&idx| row.values.get(idx).copied().flatten()).collect();
                frozen
            })
            .collect(),
    }
}

pub fn run(config: &Config) -> Result<FeatureTable> {
    let features = io::load_feature_table(&config.features_path())?;
    let dataset = select_dataset(&features);

    fs::create_dir_all(&config.artifacts_dir)?;
    let parquet_path = config.dataset_path("parquet");
    let csv_path = config.dataset_path("csv");
    io::write_feature_table(&parquet_path, &dataset)?;
    io::write_feature_csv(&csv_path, &dataset)?;
    println!(
        "Wrote {} and {} with {} rows, {} cols.",
        parquet_path.display(),
        csv_path.display(),
        dataset.rows.len(),
        // identifiers + label are stored alongside the value columns
        dataset.columns.len() + 6
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fixtures::temp_dir;
    use crate::io::{FeatureRow, Matchup};
    use std::error::Error;

    fn features() -> FeatureTable {
        FeatureTable {
            columns: vec![
                "epa_L1_home".to_string(),
                "epa_L1_away".to_string(),
                "epa_L1_diff".to_string(),
                "sack_STD_diff".to_string(),
            ],
            rows: vec![FeatureRow {
                matchup: Matchup {
                    game_id: "g1".to_string(),
                    season: 2023,
                    week: 1,
                    home_team: "AAA".to_string(),
                    away_team: "BBB".to_string(),
                },
                result: 1,
                values: vec![Some(0.5), Some(0.25), Some(0.25), None],
            }],
        }
    }

    #[test]
    fn test_select_keeps_only_diff_columns() {
        let dataset = select_dataset(&features());
        assert_eq!(dataset.columns, vec!["epa_L1_diff", "sack_STD_diff"]);
        assert_eq!(dataset.rows[0].values, vec![Some(0.25), None]);
        assert_eq!(dataset.rows[0].result, 1);
        assert_eq!(dataset.rows[0].matchup.home_team, "AAA");
    }

    #[test]
    fn test_run_writes_parquet_and_csv_snapshots() -> std::result::Result<(), Box<dyn Error>> {
        let dir = temp_dir("freeze_run");
        let config = Config {
            dataset_name: "snap".to_string(),
            artifacts_dir: dir.clone(),
            ..Config::default()
        };
        io::write_feature_table(&config.features_path(), &features())?;

        let frozen = run(&config)?;
        let back = io::load_feature_table(&dir.join("snap.parquet"))?;
        assert_eq!(back, frozen);
        assert!(dir.join("snap.csv").exists());
        Ok(())
    }
}
