//! count_report - query persisted counts and manage camera records
//!
//! Prints JSON to stdout.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;

use footfall::report::{daily_summary, day_bounds, hourly_rollup, parse_date};
use footfall::{CameraId, CountStore, FootfallConfig, SqliteCountStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the count database (defaults to the configured db_path).
    #[arg(long, env = "FOOTFALL_DB_PATH")]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List camera records.
    Cameras,
    /// Hourly rollup for one camera.
    Hourly {
        #[arg(long)]
        url: String,
        /// UTC date, YYYY-MM-DD (default: today).
        #[arg(long)]
        date: Option<String>,
    },
    /// Daily summary for every camera in a branch.
    Daily {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        date: Option<String>,
    },
    /// Mark a camera active.
    Activate {
        #[arg(long)]
        url: String,
    },
    /// Mark a camera inactive; running workers stop at their next record check.
    Deactivate {
        #[arg(long)]
        url: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let db_path = match args.db_path {
        Some(path) => path,
        None => FootfallConfig::load()?.db_path,
    };
    let mut store = SqliteCountStore::open(&db_path)?;

    let output = match args.command {
        Command::Cameras => json!({ "cameras": store.cameras()? }),
        Command::Hourly { url, date } => {
            let camera = CameraId::from_url(&url)?;
            let date = resolve_date(date.as_deref())?;
            let (from, to) = day_bounds(date)?;
            let snapshots = store.snapshots(&camera, from, to)?;
            json!({
                "camera_id": camera,
                "url": url,
                "date": date,
                "hours": hourly_rollup(&snapshots)?,
            })
        }
        Command::Daily { branch, date } => {
            let date = resolve_date(date.as_deref())?;
            let (from, to) = day_bounds(date)?;
            let cameras: Vec<_> = store
                .cameras()?
                .into_iter()
                .filter(|camera| camera.branch.as_deref() == Some(branch.as_str()))
                .collect();
            if cameras.is_empty() {
                return Err(anyhow!("no cameras recorded for branch '{}'", branch));
            }
            let mut per_camera = Vec::with_capacity(cameras.len());
            for camera in &cameras {
                per_camera.push(store.snapshots(&camera.id, from, to)?);
            }
            json!(daily_summary(&branch, date, &per_camera)?)
        }
        Command::Activate { url } => set_active(&mut store, &url, true)?,
        Command::Deactivate { url } => set_active(&mut store, &url, false)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn resolve_date(raw: Option<&str>) -> Result<chrono::NaiveDate> {
    match raw {
        Some(raw) => parse_date(raw),
        None => Ok(Utc::now().date_naive()),
    }
}

fn set_active(store: &mut SqliteCountStore, url: &str, active: bool) -> Result<serde_json::Value> {
    let camera = CameraId::from_url(url)?;
    if !store.set_camera_active(&camera, active)? {
        return Err(anyhow!("no camera record for {}", url));
    }
    Ok(json!({ "camera_id": camera, "is_active": active }))
}
