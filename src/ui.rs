// Terminal front end: pick a matchup, press Enter, read the home-win probability.
use std::collections::BTreeSet;
use std::io;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::prelude::*;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::config::Config;
use crate::error::Result;
use crate::io::{self as table_io, FeatureTable};
use crate::model::GradientBoostedClassifier;
use crate::predict::{self, MatchupQuery, Prediction};

const DEFAULT_HOME: &str = "DAL";
const DEFAULT_AWAY: &str = "PHI";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Home,
    Away,
    Season,
    Week,
}

impl Focus {
    fn next(self) -> Self {
        match self {
            Focus::Home => Focus::Away,
            Focus::Away => Focus::Season,
            Focus::Season => Focus::Week,
            Focus::Week => Focus::Home,
        }
    }

    fn prev(self) -> Self {
        match self {
            Focus::Home => Focus::Week,
            Focus::Away => Focus::Home,
            Focus::Season => Focus::Away,
            Focus::Week => Focus::Season,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Predict,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Idle,
    Probability { query: MatchupQuery, probability: f64 },
    NotFound(MatchupQuery),
    Failed(String),
}

impl Outcome {
    pub fn message(&self) -> String {
        match self {
            Outcome::Idle => "Press Enter to predict".to_string(),
            Outcome::Probability { query, probability } => format!(
                "P({} beats {}): {:.1}%",
                query.home_team,
                query.away_team,
                probability * 100.0
            ),
            Outcome::NotFound(q) => format!(
                "Matchup {} vs {} (season {}, week {}) not found in features",
                q.home_team, q.away_team, q.season, q.week
            ),
            Outcome::Failed(err) => format!("error: {err}"),
        }
    }
}

/// Selector state, kept apart from the terminal so key handling can be tested directly.
#[derive(Debug, Clone)]
pub struct UiState {
    pub teams: Vec<String>,
    pub seasons: Vec<i32>,
    pub weeks: Vec<i32>,
    pub home: usize,
    pub away: usize,
    pub season: usize,
    pub week: usize,
    pub focus: Focus,
    pub outcome: Outcome,
    pub snapshot: Vec<(String, f64)>,
    pub show_features: bool,
    pub should_quit: bool,
}

impl UiState {
    pub fn from_table(table: &FeatureTable) -> Self {
        let mut teams = BTreeSet::new();
        let mut seasons = BTreeSet::new();
        let mut weeks = BTreeSet::new();
        for row in &table.rows {
            teams.insert(row.matchup.home_team.clone());
            teams.insert(row.matchup.away_team.clone());
            seasons.insert(row.matchup.season);
            weeks.insert(row.matchup.week);
        }
        let teams: Vec<String> = teams.into_iter().collect();
        let seasons: Vec<i32> = seasons.into_iter().collect();
        let weeks: Vec<i32> = weeks.into_iter().collect();

        let position = |name: &str| teams.iter().position(|t| t == name);
        let home = position(DEFAULT_HOME).unwrap_or(0);
        let away = position(DEFAULT_AWAY).unwrap_or(if teams.len() > 1 { 1 } else { 0 });

        // latest season, then the latest week played in it
        let season = seasons.len().saturating_sub(1);
        let latest_week = seasons.last().and_then(|&s| {
            table
                .rows
                .iter()
                .filter(|r| r.matchup.season == s)
                .map(|r| r.matchup.week)
                .max()
        });
        let week = latest_week
            .and_then(|w| weeks.iter().position(|&x| x == w))
            .unwrap_or(0);

        Self {
            teams,
            seasons,
            weeks,
            home,
            away,
            season,
            week,
            focus: Focus::Home,
            outcome: Outcome::Idle,
            snapshot: Vec::new(),
            show_features: false,
            should_quit: false,
        }
    }

    /// Current selection, or `None` while any selector is empty.
    pub fn query(&self) -> Option<MatchupQuery> {
        Some(MatchupQuery {
            home_team: self.teams.get(self.home)?.clone(),
            away_team: self.teams.get(self.away)?.clone(),
            season: *self.seasons.get(self.season)?,
            week: *self.weeks.get(self.week)?,
        })
    }

    pub fn on_key(&mut self, code: KeyCode) -> Action {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                Action::Quit
            }
            KeyCode::Tab => {
                self.focus = self.focus.next();
                Action::None
            }
            KeyCode::BackTab => {
                self.focus = self.focus.prev();
                Action::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.step(true);
                Action::None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.step(false);
                Action::None
            }
            KeyCode::Char('f') => {
                self.show_features = !self.show_features;
                Action::None
            }
            KeyCode::Enter => Action::Predict,
            _ => Action::None,
        }
    }

    fn step(&mut self, forward: bool) {
        let (idx, len) = match self.focus {
            Focus::Home => (&mut self.home, self.teams.len()),
            Focus::Away => (&mut self.away, self.teams.len()),
            Focus::Season => (&mut self.season, self.seasons.len()),
            Focus::Week => (&mut self.week, self.weeks.len()),
        };
        if len == 0 {
            return;
        }
        *idx = if forward { (*idx + 1) % len } else { (*idx + len - 1) % len };
    }

    pub fn apply_prediction(&mut self, query: MatchupQuery, prediction: Result<Prediction>) {
        match prediction {
            Ok(Prediction::Found { probability, features }) => {
                self.outcome = Outcome::Probability { query, probability };
                self.snapshot = features;
            }
            Ok(Prediction::NotFound) => {
                self.outcome = Outcome::NotFound(query);
                self.snapshot.clear();
            }
            Err(err) => {
                self.outcome = Outcome::Failed(err.to_string());
                self.snapshot.clear();
            }
        }
    }
}

pub fn run(config: &Config) -> Result<()> {
    let model = GradientBoostedClassifier::load(&config.model_path())?;
    let table = table_io::load_feature_table(&config.features_path())?;
    let mut state = UiState::from_table(&table);

    enable_raw_mode()?;
    with_restore(
        || {
            let mut stdout = io::stdout();
            execute!(stdout, EnterAlternateScreen)?;
            let backend = CrosstermBackend::new(stdout);
            let mut terminal = Terminal::new(backend)?;

            let res = run_app(&mut terminal, &mut state, &model, &table);

            execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
            terminal.show_cursor()?;
            res
        },
        disable_raw_mode,
    )?;
    Ok(())
}

/// Runs `body`, then `restore` whether or not `body` failed. The body's error wins.
fn with_restore<T>(
    body: impl FnOnce() -> io::Result<T>,
    restore: impl FnOnce() -> io::Result<()>,
) -> io::Result<T> {
    let res = body();
    let restored = restore();
    let value = res?;
    restored?;
    Ok(value)
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    state: &mut UiState,
    model: &GradientBoostedClassifier,
    table: &FeatureTable,
) -> io::Result<()> {
    let tick_rate = Duration::from_millis(250);
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| render(f, state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && state.on_key(key.code) == Action::Predict {
                    if let Some(query) = state.query() {
                        let prediction = predict::predict_matchup(model, table, &query);
                        state.apply_prediction(query, prediction);
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }

        if state.should_quit {
            return Ok(());
        }
    }
}

fn render(frame: &mut Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(1),
            Constraint::Length(2),
        ])
        .split(frame.size());

    let header = Paragraph::new("GRIDIRON WIN PROBABILITY")
        .style(Style::default().add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    let selectors = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(25); 4])
        .split(chunks[1]);
    let items = [
        (Focus::Home, "Home", state.teams.get(state.home).cloned()),
        (Focus::Away, "Away", state.teams.get(state.away).cloned()),
        (Focus::Season, "Season", state.seasons.get(state.season).map(|s| s.to_string())),
        (Focus::Week, "Week", state.weeks.get(state.week).map(|w| w.to_string())),
    ];
    for ((focus, title, value), area) in items.into_iter().zip(selectors.iter()) {
        let style = if state.focus == focus {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        let widget = Paragraph::new(value.unwrap_or_else(|| "-".to_string()))
            .style(style)
            .block(Block::default().title(title).borders(Borders::ALL));
        frame.render_widget(widget, *area);
    }

    let outcome_style = match state.outcome {
        Outcome::Probability { .. } => Style::default().fg(Color::Green),
        Outcome::NotFound(_) | Outcome::Failed(_) => Style::default().fg(Color::Red),
        Outcome::Idle => Style::default().fg(Color::DarkGray),
    };
    let outcome = Paragraph::new(state.outcome.message())
        .style(outcome_style)
        .block(Block::default().title("Prediction").borders(Borders::ALL));
    frame.render_widget(outcome, chunks[2]);

    if state.show_features {
        let lines: Vec<String> = if state.snapshot.is_empty() {
            vec!["No features for the current selection".to_string()]
        } else {
            state
                .snapshot
                .iter()
                .map(|(name, value)| format!("{name:<40} {value:>10.4}"))
                .collect()
        };
        let features = Paragraph::new(lines.join("\n"))
            .wrap(Wrap { trim: false })
            .block(Block::default().title("Feature snapshot").borders(Borders::ALL));
        frame.render_widget(features, chunks[3]);
    }

    let footer = Paragraph::new("Tab/Shift-Tab Focus | ↑/↓ Change | Enter Predict | f Features | q Quit")
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(footer, chunks[4]);
}
