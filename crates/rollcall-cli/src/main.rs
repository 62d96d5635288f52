use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{ArcFaceModel, FaceLocator, FeatureExtractor, LocatorConfig, ScrfdModel};
use rollcall_store::{IdentityStore, Profile};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::MatchOutcome;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment and identification")]
struct Cli {
    /// Identity database (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory holding det_10g.onnx and w600k_r50.onnx (overrides config)
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    /// Minimum cosine similarity for a match (overrides config)
    #[arg(long, global = true)]
    threshold: Option<f32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the single face in an image
    Enroll {
        image: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Identify the main face in one or more images
    Identify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Treat the images as consecutive frames of a live feed
        #[arg(long)]
        live: bool,
        /// Time between frames in live mode
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
        /// Print outcomes as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List enrolled identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one identity
    Show { id: i64 },
    /// Change an identity's name
    Rename { id: i64, name: String },
    /// Move an identity to a new id
    Reassign { old_id: i64, new_id: i64 },
    /// Remove an identity
    Remove { id: i64 },
    /// Write an identity's aligned reference face as PNG
    ExportFace { id: i64, output: PathBuf },
}

#[derive(Args)]
struct ProfileArgs {
    #[arg(short, long)]
    name: String,
    /// Explicit id; the next free id is used when omitted
    #[arg(long)]
    id: Option<i64>,
    #[arg(long, default_value = "")]
    gender: String,
    #[arg(long, default_value = "")]
    position: String,
    #[arg(long, default_value = "")]
    department: String,
    #[arg(long, default_value = "")]
    person_type: String,
    #[arg(long, default_value = "")]
    entry_date: String,
}

impl From<ProfileArgs> for Profile {
    fn from(a: ProfileArgs) -> Self {
        Profile {
            id: a.id,
            name: a.name,
            gender: a.gender,
            position: a.position,
            department: a.department,
            person_type: a.person_type,
            entry_date: a.entry_date,
        }
    }
}

type OnnxLocator = FaceLocator<ScrfdModel>;
type OnnxExtractor = FeatureExtractor<ScrfdModel, ArcFaceModel>;

/// Load the detector (twice: locator and landmarker) and the recognizer.
fn load_models(config: &Config) -> Result<(OnnxLocator, OnnxExtractor)> {
    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdModel::load(&scrfd_path)?;
    let landmarker = ScrfdModel::load(&scrfd_path)?;
    let recognizer = ArcFaceModel::load(&config.arcface_model_path())?;

    let locator = FaceLocator::with_config(
        detector,
        LocatorConfig {
            cache_window: config.cache_window,
            enhance_live: config.enhance_live_frames,
            ..LocatorConfig::default()
        },
    );
    let extractor =
        FeatureExtractor::new(landmarker, recognizer).with_eye_distance(config.desired_eye_distance);
    Ok((locator, extractor))
}

/// Capture time of frame `index` in a feed starting at `start`. Offsets
/// past what `Instant` can represent are halved until they fit.
fn frame_time(start: Instant, interval_ms: u64, index: usize) -> Instant {
    let mut offset = Duration::from_millis(interval_ms.saturating_mul(index as u64));
    loop {
        if let Some(t) = start.checked_add(offset) {
            return t;
        }
        offset /= 2;
    }
}

fn load_image(path: &Path) -> Result<image::RgbImage> {
    let img = image::open(path).with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(img.to_rgb8())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(models) = cli.models {
        config.model_dir = models;
    }
    if let Some(t) = cli.threshold {
        config.similarity_threshold = t;
    }
    config.validate()?;

    let store = IdentityStore::open(&config.db_path)
        .with_context(|| format!("cannot open identity store {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll { image: path, profile } => {
            let img = load_image(&path)?;
            let (mut locator, mut extractor) = load_models(&config)?;
            let profile = Profile::from(profile);
            let id = engine::enroll_image(&img, &mut locator, &mut extractor, &store, &profile)?;
            println!("Enrolled {} as id {id}", profile.name);
        }
        Commands::Identify {
            images,
            live,
            interval_ms,
            json,
        } => {
            let (mut locator, mut extractor) = load_models(&config)?;
            let start = Instant::now();
            for (i, path) in images.iter().enumerate() {
                let img = load_image(path)?;
                let outcome = if live {
                    engine::identify_frame(
                        &img,
                        frame_time(start, interval_ms, i),
                        &mut locator,
                        &mut extractor,
                        &store,
                        config.similarity_threshold,
                    )?
                } else {
                    engine::identify(
                        &img,
                        &mut locator,
                        &mut extractor,
                        &store,
                        config.similarity_threshold,
                    )?
                };
                print_outcome(path, &outcome, json)?;
            }
        }
        Commands::List { json } => {
            let records = store.all_records()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No identities enrolled");
            } else {
                println!("{:<6} {:<24} {:<16} {:<16} CREATED", "ID", "NAME", "DEPARTMENT", "POSITION");
                for r in &records {
                    println!(
                        "{:<6} {:<24} {:<16} {:<16} {}",
                        r.id,
                        r.name,
                        r.department,
                        r.position,
                        r.create_time.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Show { id } => {
            let r = store.get(id)?;
            println!("id:          {}", r.id);
            println!("name:        {}", r.name);
            println!("gender:      {}", r.gender);
            println!("position:    {}", r.position);
            println!("department:  {}", r.department);
            println!("person type: {}", r.person_type);
            println!("entry date:  {}", r.entry_date);
            println!("vector:      {} dims", r.features.dimension());
            println!(
                "face image:  {}",
                r.face_image
                    .as_ref()
                    .map_or("none".to_string(), |b| format!("{} bytes", b.len()))
            );
            println!("created:     {}", r.create_time.to_rfc3339());
        }
        Commands::Rename { id, name } => {
            store.update_name(id, &name)?;
            println!("Renamed {id} to {name}");
        }
        Commands::Reassign { old_id, new_id } => {
            store.update_id(old_id, new_id)?;
            println!("Moved {old_id} to {new_id}");
        }
        Commands::Remove { id } => {
            if store.delete(id)? {
                println!("Removed {id}");
            } else {
                println!("No identity with id {id}");
            }
        }
        Commands::ExportFace { id, output } => {
            let record = store.get(id)?;
            let Some(png) = record.face_image else {
                bail!("identity {id} has no reference image");
            };
            std::fs::write(&output, png)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }

    store.close()?;
    Ok(())
}

fn print_outcome(path: &Path, outcome: &MatchOutcome, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({
            "image": path.display().to_string(),
            "result": outcome,
        });
        println!("{line}");
    } else {
        println!("{}: {outcome}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_time_spacing() {
        let start = Instant::now();
        assert_eq!(frame_time(start, 33, 0), start);
        assert_eq!(frame_time(start, 33, 3), start + Duration::from_millis(99));
    }

    #[test]
    fn test_frame_time_huge_interval_does_not_panic() {
        let start = Instant::now();
        let late = frame_time(start, u64::MAX, 2);
        assert!(late > start);
        assert!(frame_time(start, u64::MAX, usize::MAX) >= late);
    }
}
