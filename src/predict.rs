// Win-probability lookups against the feature table and the persisted classifier.
use std::collections::HashMap;

use ndarray::Array2;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::freeze::is_diff_column;
use crate::io::{self, FeatureRow, FeatureTable};
use crate::model::GradientBoostedClassifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchupQuery {
    pub home_team: String,
    pub away_team: String,
    pub season: i32,
    pub week: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Found {
        /// Probability that the home team wins.
        probability: f64,
        /// Differential features fed to the model, nulls already filled.
        features: Vec<(String, f64)>,
    },
    NotFound,
}

/// Last row of `table` scheduled exactly as `query`.
pub fn lookup_matchup<'a>(table: &'a FeatureTable, query: &MatchupQuery) -> Option<&'a FeatureRow> {
    table.rows.iter().rev().find(|row| {
        let m = &row.matchup;
        m.home_team == query.home_team
            && m.away_team == query.away_team
            && m.season == query.season
            && m.week == query.week
    })
}

/// Differential columns of `row`, nulls filled with 0.0.
pub fn diff_snapshot(table: &FeatureTable, row: &FeatureRow) -> Vec<(String, f64)> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| is_diff_column(name))
        .map(|(idx, name)| (name.clone(), row.values.get(idx).copied().flatten().unwrap_or(0.0)))
        .collect()
}

/// Single-row model input ordered like the model's training columns; absent names become 0.0.
pub fn feature_vector(model: &GradientBoostedClassifier, features: &[(String, f64)]) -> Array2<f64> {
    let by_name: HashMap<&str, f64> = features.iter().map(|(n, v)| (n.as_str(), *v)).collect();
    Array2::from_shape_fn((1, model.feature_names.len()), |(_, j)| {
        by_name.get(model.feature_names[j].as_str()).copied().unwrap_or(0.0)
    })
}

fn probability(model: &GradientBoostedClassifier, features: &[(String, f64)]) -> Result<f64> {
    let proba = model.predict_proba(feature_vector(model, features).view())?;
    proba
        .get(0)
        .copied()
        .ok_or_else(|| PipelineError::Model("model returned no probability".to_string()))
}

pub fn predict_matchup(
    model: &GradientBoostedClassifier,
    table: &FeatureTable,
    query: &MatchupQuery,
) -> Result<Prediction> {
    let Some(row) = lookup_matchup(table, query) else {
        return Ok(Prediction::NotFound);
    };
    let features = diff_snapshot(table, row);
    let probability = probability(model, &features)?;
    Ok(Prediction::Found { probability, features })
}

/// A team's most recent side values keyed by feature name (`epa_L3`, ...), taken from the
/// `_home` or `_away` columns depending on where it played. Later rows win ties.
pub fn latest_team_features(table: &FeatureTable, team: &str) -> Option<HashMap<String, Option<f64>>> {
    let mut latest: Option<(&FeatureRow, &str)> = None;
    for row in &table.rows {
        let m = &row.matchup;
        let side = if m.home_team == team {
            "home"
        } else if m.away_team == team {
            "away"
        } else {
            continue;
        };
        let newer = latest.map_or(true, |(prev, _)| {
            (m.season, m.week) >= (prev.matchup.season, prev.matchup.week)
        });
        if newer {
            latest = Some((row, side));
        }
    }

    let (row, side) = latest?;
    let suffix = format!("_{side}");
    Some(
        table
            .columns
            .iter()
            .zip(&row.values)
            .filter_map(|(name, value)| name.strip_suffix(&suffix).map(|base| (base.to_string(), *value)))
            .collect(),
    )
}

/// Home-win probability for an arbitrary pairing built from each team's latest form.
pub fn predict_teams(
    model: &GradientBoostedClassifier,
    table: &FeatureTable,
    home: &str,
    away: &str,
) -> Result<f64> {
    let missing = |team: &str| PipelineError::Validation(format!("team {team} has no data in the feature table"));
    let home_form = latest_team_features(table, home).ok_or_else(|| missing(home))?;
    let away_form = latest_team_features(table, away).ok_or_else(|| missing(away))?;

    let features: Vec<(String, f64)> = model
        .feature_names
        .iter()
        .map(|name| {
            let base = name.strip_suffix("_diff").unwrap_or(name);
            let h = home_form.get(base).copied().flatten();
            let a = away_form.get(base).copied().flatten();
            let diff = h.zip(a).map(|(h, a)| h - a).unwrap_or(0.0);
            (name.clone(), diff)
        })
        .collect();
    probability(model, &features)
}

/// The `predict` command.
pub fn run_cli(config: &Config, home: &str, away: &str, season: Option<i32>, week: Option<i32>) -> Result<()> {
    let model = GradientBoostedClassifier::load(&config.model_path())?;
    let table = io::load_feature_table(&config.features_path())?;
    println!(
        "Loaded model trained {} with {} trees",
        model.trained_at.format("%Y-%m-%d %H:%M UTC"),
        model.n_trees()
    );

    let probability = match (season, week) {
        (Some(season), Some(week)) => {
            let query = MatchupQuery {
                home_team: home.to_string(),
                away_team: away.to_string(),
                season,
                week,
            };
            match predict_matchup(&model, &table, &query)? {
                Prediction::Found { probability, .. } => probability,
                Prediction::NotFound => {
                    println!("Matchup {home} vs {away} (season {season}, week {week}) not found in features.");
                    return Ok(());
                }
            }
        }
        _ => predict_teams(&model, &table, home, away)?,
    };

    println!("{home} win probability: {:.2}%", probability * 100.0);
    println!("{away} win probability: {:.2}%", (1.0 - probability) * 100.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Matchup;
    use crate::model::BoostParams;
    use ndarray::array;

    fn row(game: &str, season: i32, week: i32, home: &str, away: &str, values: Vec<Option<f64>>) -> FeatureRow {
        FeatureRow {
            matchup: Matchup {
                game_id: game.to_string(),
                season,
                week,
                home_team: home.to_string(),
                away_team: away.to_string(),
            },
            result: 0,
            values,
        }
    }

    fn table() -> FeatureTable {
        FeatureTable {
            columns: vec![
                "epa_L3_home".to_string(),
                "epa_L3_away".to_string(),
                "epa_L3_diff".to_string(),
            ],
            rows: vec![
                row("g1", 2023, 1, "AAA", "BBB", vec![Some(0.4), Some(0.1), Some(0.3)]),
                row("g2", 2023, 2, "BBB", "CCC", vec![Some(0.2), None, None]),
                row("g1b", 2023, 1, "AAA", "BBB", vec![Some(0.9), Some(0.1), Some(0.8)]),
            ],
        }
    }

    fn model() -> GradientBoostedClassifier {
        let x = array![[-1.0], [-0.5], [0.5], [1.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let params = BoostParams { min_child_weight: 0.0, n_estimators: 10, ..BoostParams::default() };
        GradientBoostedClassifier::fit(x.view(), y.view(), vec!["epa_L3_diff".to_string()], params)
            .expect("fit")
    }

    fn query(home: &str, away: &str, season: i32, week: i32) -> MatchupQuery {
        MatchupQuery {
            home_team: home.to_string(),
            away_team: away.to_string(),
            season,
            week,
        }
    }

    #[test]
    fn test_lookup_uses_last_matching_row() {
        let t = table();
        let found = lookup_matchup(&t, &query("AAA", "BBB", 2023, 1)).unwrap();
        assert_eq!(found.matchup.game_id, "g1b");
        assert!(lookup_matchup(&t, &query("BBB", "AAA", 2023, 1)).is_none());
    }

    #[test]
    fn test_snapshot_fills_nulls_and_keeps_only_diffs() {
        let t = table();
        assert_eq!(diff_snapshot(&t, &t.rows[1]), vec![("epa_L3_diff".to_string(), 0.0)]);
    }

    #[test]
    fn test_predict_matchup_found_and_not_found() -> Result<()> {
        let t = table();
        let m = model();
        match predict_matchup(&m, &t, &query("AAA", "BBB", 2023, 1))? {
            Prediction::Found { probability, features } => {
                assert!(probability > 0.5 && probability <= 1.0);
                assert_eq!(features, vec![("epa_L3_diff".to_string(), 0.8)]);
            }
            Prediction::NotFound => panic!("matchup should exist"),
        }
        assert_eq!(predict_matchup(&m, &t, &query("AAA", "ZZZ", 2023, 1))?, Prediction::NotFound);
        Ok(())
    }

    #[test]
    fn test_feature_vector_follows_model_order() {
        let m = model();
        let v = feature_vector(&m, &[("other".to_string(), 5.0), ("epa_L3_diff".to_string(), -0.25)]);
        assert_eq!(v, array![[-0.25]]);
        assert_eq!(feature_vector(&m, &[]), array![[0.0]]);
    }

    #[test]
    fn test_latest_team_features_pick_the_right_side() {
        let t = table();
        let bbb = latest_team_features(&t, "BBB").unwrap();
        // BBB's latest game is week 2 at home
        assert_eq!(bbb["epa_L3"], Some(0.2));
        let ccc = latest_team_features(&t, "CCC").unwrap();
        assert_eq!(ccc["epa_L3"], None);
        let aaa = latest_team_features(&t, "AAA").unwrap();
        assert_eq!(aaa["epa_L3"], Some(0.9));
        assert!(latest_team_features(&t, "ZZZ").is_none());
    }

    #[test]
    fn test_predict_teams_requires_both_teams() -> Result<()> {
        let t = table();
        let m = model();
        let p = predict_teams(&m, &t, "AAA", "BBB")?;
        assert!((0.0..=1.0).contains(&p));
        let err = predict_teams(&m, &t, "AAA", "ZZZ").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        Ok(())
    }
}
