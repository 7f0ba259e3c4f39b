// Feature engineering: team-game aggregation, weekly stat merge, rolling and season-to-date means,
// and the home-minus-away matchup table the model trains on.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::io::{self, FeatureRow, FeatureTable, Matchup, PlayTable, TeamWeekTable};

pub const WINDOWS: [usize; 3] = [1, 3, 5];
/// Per-column feature suffixes that get a home-minus-away differential.
pub const FEATURE_SUFFIXES: [&str; 6] = ["L1", "L3", "L5", "STD", "delta_L3", "delta_L5"];

/// Null-skipping arithmetic mean.
#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn sub(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? - b?)
}

/// One team's side of one game.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamGame {
    pub game_id: String,
    pub season: i32,
    pub week: i32,
    pub team: String,
    pub is_home: bool,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamGameTable {
    pub columns: Vec<String>,
    pub rows: Vec<TeamGame>,
}

impl TeamGameTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Team games with derived columns appended after the base columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    pub base_columns: Vec<String>,
    pub table: TeamGameTable,
}

/// input: play table
/// output: one row per (game, team, side) holding the mean of every numeric play column
/// logic: for the home side then the away side, group plays by game/season/week/side team
/// (sorted by key) and average each column, skipping nulls
pub fn aggregate_team_games(plays: &PlayTable) -> TeamGameTable {
    let width = plays.columns.len();
    let mut rows = Vec::new();

    for is_home in [true, false] {
        let mut groups: BTreeMap<(&str, i32, i32, &str), Vec<RunningMean>> = BTreeMap::new();
        for play in &plays.plays {
            let g = &play.game;
            let team = if is_home { &g.home_team } else { &g.away_team };
            let acc = groups
                .entry((g.game_id.as_str(), g.season, g.week, team.as_str()))
                .or_insert_with(|| vec![RunningMean::default(); width]);
            for (mean, value) in acc.iter_mut().zip(&play.values) {
                mean.push(*value);
            }
        }
        rows.extend(groups.into_iter().map(|((game_id, season, week, team), acc)| TeamGame {
            game_id: game_id.to_string(),
            season,
            week,
            team: team.to_string(),
            is_home,
            values: acc.iter().map(RunningMean::mean).collect(),
        }));
    }

    TeamGameTable { columns: plays.columns.clone(), rows }
}

/// Left-joins weekly team stats on (season, week, team). Colliding names get an `_adv` suffix;
/// unmatched team games carry nulls. The first row of a duplicated stat key wins.
pub fn merge_team_weeks(team_games: TeamGameTable, team_weeks: &TeamWeekTable) -> TeamGameTable {
    let mut columns = team_games.columns;
    let existing: HashSet<String> = columns.iter().cloned().collect();
    columns.extend(team_weeks.columns.iter().map(|c| {
        if existing.contains(c) {
            format!("{c}_adv")
        } else {
            c.clone()
        }
    }));

    let mut lookup: HashMap<(i32, i32, &str), &[Option<f64>]> = HashMap::new();
    for row in &team_weeks.rows {
        lookup
            .entry((row.season, row.week, row.team.as_str()))
            .or_insert(row.values.as_slice());
    }

    let stat_width = team_weeks.columns.len();
    let rows = team_games
        .rows
        .into_iter()
        .map(|mut game| {
            match lookup.get(&(game.season, game.week, game.team.as_str())) {
                Some(stats) => game.values.extend_from_slice(stats),
                None => game.values.extend(std::iter::repeat(None).take(stat_width)),
            }
            game
        })
        .collect();

    TeamGameTable { columns, rows }
}

/// Names of the derived columns for `base`, in the order they are appended.
pub fn feature_columns(base: &[String]) -> Vec<String> {
    let mut names = Vec::with_capacity(base.len() * FEATURE_SUFFIXES.len());
    for window in WINDOWS {
        names.extend(base.iter().map(|c| format!("{c}_L{window}")));
    }
    names.extend(base.iter().map(|c| format!("{c}_STD")));
    for c in base {
        names.push(format!("{c}_delta_L3"));
        names.push(format!("{c}_delta_L5"));
    }
    names
}

/// input: merged team-game table
/// output: the same rows, ordered by (team, season, week, game_id), with rolling, season-to-date
/// and delta columns appended
/// logic: walk each team's games in time order; trailing means over the last 1/3/5 games span
/// seasons, the season-to-date mean resets when the season changes. Derived values are keyed by
/// (team, game_id) and joined back by key.
pub fn add_rolling_features(merged: TeamGameTable) -> FeatureFrame {
    let TeamGameTable { columns: base_columns, mut rows } = merged;
    let width = base_columns.len();
    rows.sort_by(|a, b| {
        (&a.team, a.season, a.week, &a.game_id).cmp(&(&b.team, b.season, b.week, &b.game_id))
    });

    let mut derived: HashMap<(String, String), Vec<Option<f64>>> = HashMap::new();
    let mut start = 0;
    while start < rows.len() {
        let team = &rows[start].team;
        let end = start + rows[start..].iter().take_while(|r| &r.team == team).count();
        let history = &rows[start..end];

        let mut season_means: Vec<RunningMean> = Vec::new();
        let mut current_season = None;
        for (pos, row) in history.iter().enumerate() {
            if current_season != Some(row.season) {
                current_season = Some(row.season);
                season_means = vec![RunningMean::default(); width];
            }
            for (mean, value) in season_means.iter_mut().zip(&row.values) {
                mean.push(*value);
            }

            let mut features = Vec::with_capacity(width * FEATURE_SUFFIXES.len());
            let mut windows: Vec<Vec<Option<f64>>> = Vec::with_capacity(WINDOWS.len());
            for window in WINDOWS {
                let first = (pos + 1).saturating_sub(window);
                let rolled: Vec<Option<f64>> = (0..width)
                    .map(|col| {
                        let mut mean = RunningMean::default();
                        for past in &history[first..=pos] {
                            mean.push(past.values[col]);
                        }
                        mean.mean()
                    })
                    .collect();
                features.extend_from_slice(&rolled);
                windows.push(rolled);
            }
            let to_date: Vec<Option<f64>> = season_means.iter().map(RunningMean::mean).collect();
            features.extend_from_slice(&to_date);
            for col in 0..width {
                features.push(sub(windows[1][col], to_date[col]));
                features.push(sub(windows[2][col], to_date[col]));
            }

            derived.insert((row.team.clone(), row.game_id.clone()), features);
        }
        start = end;
    }

    let derived_width = width * FEATURE_SUFFIXES.len();
    for row in rows.iter_mut() {
        match derived.remove(&(row.team.clone(), row.game_id.clone())) {
            Some(features) => row.values.extend(features),
            None => row.values.extend(std::iter::repeat(None).take(derived_width)),
        }
    }

    let mut columns = base_columns.clone();
    columns.extend(feature_columns(&base_columns));
    FeatureFrame {
        base_columns,
        table: TeamGameTable { columns, rows },
    }
}

/// Distinct games in the order they first appear in the play table.
pub fn distinct_matchups(plays: &PlayTable) -> Vec<Matchup> {
    let mut seen = HashSet::new();
    plays
        .plays
        .iter()
        .filter(|p| seen.insert(&p.game))
        .map(|p| p.game.clone())
        .collect()
}

/// Matchup rows before labels are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchupTable {
    pub columns: Vec<String>,
    pub rows: Vec<(Matchup, Vec<Option<f64>>)>,
}

/// input: play table, feature frame
/// output: one row per game with `_home`/`_away` copies of every frame column and
/// `<col>_<suffix>_diff` differentials
/// logic: inner-join each game to its home-side and away-side team rows; games missing a side
/// are dropped
pub fn build_matchups(plays: &PlayTable, frame: &FeatureFrame) -> MatchupTable {
    let table = &frame.table;
    let mut sides: HashMap<(&str, &str, bool), &[Option<f64>]> = HashMap::new();
    for row in &table.rows {
        sides
            .entry((row.game_id.as_str(), row.team.as_str(), row.is_home))
            .or_insert(row.values.as_slice());
    }

    let mut diff_pairs = Vec::new();
    let mut diff_names = Vec::new();
    for base in &frame.base_columns {
        for suffix in FEATURE_SUFFIXES {
            let name = format!("{base}_{suffix}");
            if let Some(idx) = table.column_index(&name) {
                diff_pairs.push(idx);
                diff_names.push(format!("{name}_diff"));
            }
        }
    }

    let mut columns: Vec<String> = Vec::with_capacity(table.columns.len() * 2 + diff_names.len());
    columns.extend(table.columns.iter().map(|c| format!("{c}_home")));
    columns.extend(table.columns.iter().map(|c| format!("{c}_away")));
    columns.extend(diff_names);

    let mut rows = Vec::new();
    for matchup in distinct_matchups(plays) {
        let home = sides.get(&(matchup.game_id.as_str(), matchup.home_team.as_str(), true));
        let away = sides.get(&(matchup.game_id.as_str(), matchup.away_team.as_str(), false));
        let (Some(home), Some(away)) = (home, away) else {
            continue;
        };
        let mut values = Vec::with_capacity(columns.len());
        values.extend_from_slice(home);
        values.extend_from_slice(away);
        values.extend(diff_pairs.iter().map(|&idx| sub(home[idx], away[idx])));
        rows.push((matchup, values));
    }

    MatchupTable { columns, rows }
}

/// Home-win label per game from the last recorded scores: 1 when the last non-null home score is
/// strictly greater than the last non-null away score, otherwise 0 (ties and unfinished games
/// included).
pub fn game_results(plays: &PlayTable) -> Result<HashMap<String, i32>> {
    let score_column = |name: &str| {
        plays.column_index(name).ok_or_else(|| {
            PipelineError::Validation(format!("play-by-play data has no {name} column"))
        })
    };
    let home_idx = score_column("home_score")?;
    let away_idx = score_column("away_score")?;

    let mut last: HashMap<&str, (Option<f64>, Option<f64>)> = HashMap::new();
    for play in &plays.plays {
        let entry = last.entry(play.game.game_id.as_str()).or_default();
        if let Some(home) = play.values[home_idx] {
            entry.0 = Some(home);
        }
        if let Some(away) = play.values[away_idx] {
            entry.1 = Some(away);
        }
    }

    Ok(last
        .into_iter()
        .map(|(game_id, scores)| {
            let won = matches!(scores, (Some(home), Some(away)) if home > away);
            (game_id.to_string(), i32::from(won))
        })
        .collect())
}

pub fn attach_results(plays: &PlayTable, matchups: MatchupTable) -> Result<FeatureTable> {
    let results = game_results(plays)?;
    let rows = matchups
        .rows
        .into_iter()
        .map(|(matchup, values)| FeatureRow {
            result: results.get(&matchup.game_id).copied().unwrap_or(0),
            matchup,
            values,
        })
        .collect();
    Ok(FeatureTable { columns: matchups.columns, rows })
}

/// Full feature build over in-memory tables.
pub fn build(plays: &PlayTable, team_weeks: &TeamWeekTable) -> Result<FeatureTable> {
    println!("Aggregating team-game stats from {} plays...", plays.plays.len());
    let team_games = aggregate_team_games(plays);
    println!("Merging team weekly stats...");
    let merged = merge_team_weeks(team_games, team_weeks);
    println!("Building rolling averages & deltas...");
    let frame = add_rolling_features(merged);
    println!("Building matchup dataset...");
    let matchups = build_matchups(plays, &frame);
    println!("Adding results...");
    attach_results(plays, matchups)
}

/// The build-features stage: reads the configured seasons and writes `features.parquet`.
pub fn run(config: &Config) -> Result<FeatureTable> {
    let seasons = config.seasons();
    let play_paths: Vec<_> = seasons.iter().map(|&s| config.play_by_play_path(s)).collect();
    let stat_paths: Vec<_> = seasons.iter().map(|&s| config.team_week_path(s)).collect();

    println!(
        "Loading play-by-play and team stats for seasons {}-{}...",
        config.start_season, config.end_season
    );
    let plays = io::load_plays(&play_paths, &config.play_columns)?;
    let team_weeks = io::load_team_weeks(&stat_paths)?;

    let table = build(&plays, &team_weeks)?;

    fs::create_dir_all(&config.artifacts_dir)?;
    let out_path = config.features_path();
    io::write_feature_table(&out_path, &table)?;
    println!(
        "Features saved to {} ({} games, {} columns)",
        out_path.display(),
        table.rows.len(),
        table.columns.len()
    );
    Ok(table)
}
