// Downloads the per-season play-by-play and team-week parquet files into the data directory.
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::{PipelineError, Result};

const ATTEMPTS: u32 = 4;

pub fn play_by_play_url(base_url: &str, season: i32) -> String {
    format!("{}/pbp/play_by_play_{season}.parquet", base_url.trim_end_matches('/'))
}

pub fn team_week_url(base_url: &str, season: i32) -> String {
    format!(
        "{}/stats_team/stats_team_week_{season}.parquet",
        base_url.trim_end_matches('/')
    )
}

fn download_file(client: &reqwest::blocking::Client, url: &str, path: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        let fetched = client
            .get(url)
            .send()
            .and_then(|res| res.error_for_status())
            .and_then(|res| res.bytes());
        match fetched {
            Ok(bytes) => {
                fs::write(path, &bytes)?;
                return Ok(());
            }
            Err(err) => {
                eprintln!("Download attempt {attempt}/{ATTEMPTS} for {url} failed: {err}");
                last_err = Some(err);
                if attempt < ATTEMPTS {
                    thread::sleep(Duration::from_millis(500 * u64::from(attempt)));
                }
            }
        }
    }
    Err(match last_err {
        Some(err) => PipelineError::Http(err),
        None => PipelineError::Validation(format!("download failed for {url}")),
    })
}

/// Fetches seasons `start..=end`, overwriting earlier downloads.
pub fn run(config: &Config, start: i32, end: i32) -> Result<()> {
    if start > end {
        return Err(PipelineError::Validation(format!(
            "start season {start} is after end season {end}"
        )));
    }
    fs::create_dir_all(&config.data_dir)?;
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("gridiron-winprob/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(300))
        .build()?;

    let seasons: Vec<i32> = (start..=end).collect();
    println!("Fetching seasons: {seasons:?}");
    for season in seasons {
        let targets = [
            (play_by_play_url(&config.base_url, season), config.play_by_play_path(season)),
            (team_week_url(&config.base_url, season), config.team_week_path(season)),
        ];
        for (url, path) in targets {
            println!("Downloading {url}");
            download_file(&client, &url, &path)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}
