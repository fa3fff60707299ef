use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rollcall_core::{
    enrollment_images, parse_confidence_floor, BatchWrite, EnrollmentRequest, ImageInput, KeyScheme, ModelPaths,
    RecognitionConfig, RecognitionService, StoreId, Strictness, VerifyScope,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Directory containing the ONNX models
    #[arg(long, global = true, env = "ROLLCALL_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Root directory of the embedding stores
    #[arg(long, global = true, env = "ROLLCALL_STORE_DIR")]
    store_dir: Option<PathBuf>,
    /// Cosine similarity a match must exceed
    #[arg(long, global = true, default_value_t = 0.6)]
    threshold: f32,
    /// Detector score a face box must reach
    #[arg(long, global = true, default_value_t = 0.5)]
    detection_threshold: f32,
    /// Detection confidence floor for bulk enrollment
    #[arg(long, global = true, default_value_t = 0.9)]
    enroll_floor: f32,
    /// Detection confidence floor for verification, or "off"
    #[arg(long, global = true, default_value = "0.9", value_parser = parse_confidence_floor)]
    verify_floor: ::std::option::Option<f32>,
    /// Stores consulted when verifying
    #[arg(long, global = true, value_enum, default_value_t = Scope::ClaimedGroup)]
    scope: Scope,
    /// Identity keys are numeric student IDs
    #[arg(long, global = true)]
    numeric_ids: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    ClaimedGroup,
    AllGroups,
}

#[derive(Args)]
struct Group {
    /// Owner of the group (e.g. instructor id)
    #[arg(long)]
    owner: String,
    /// Group name (e.g. class)
    #[arg(long)]
    group: String,
}

impl Group {
    fn store_id(&self) -> Result<StoreId> {
        Ok(StoreId::new(self.owner.as_str(), self.group.as_str())?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print detected face boxes
    Detect { image: PathBuf },
    /// Enroll an identity from one or more photos
    Enroll {
        #[command(flatten)]
        group: Group,
        #[arg(long)]
        key: String,
        /// Drop detections below the bulk confidence floor
        #[arg(long)]
        bulk: bool,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Re-enroll an identity from a photo directory
    EnrollDir {
        #[command(flatten)]
        group: Group,
        #[arg(long)]
        key: String,
        dir: PathBuf,
    },
    /// Enroll a whole group: one subdirectory of photos per identity
    EnrollGroup {
        #[command(flatten)]
        group: Group,
        /// Keep identities already in the store
        #[arg(long)]
        merge: bool,
        dir: PathBuf,
    },
    /// Identify every face in a photo
    Recognize {
        #[command(flatten)]
        group: Group,
        image: PathBuf,
    },
    /// Check a photo against a claimed identity
    Verify {
        #[command(flatten)]
        group: Group,
        #[arg(long)]
        key: String,
        image: PathBuf,
    },
    /// Copy an identity into another group
    Transfer {
        #[arg(long)]
        key: String,
        #[arg(long, requires = "from_group")]
        from_owner: Option<String>,
        #[arg(long, requires = "from_owner")]
        from_group: Option<String>,
        #[arg(long)]
        to_owner: String,
        #[arg(long)]
        to_group: String,
    },
    /// List enrolled identities
    List {
        #[command(flatten)]
        group: Group,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let service = open_service(&cli)?;

    match cli.command {
        Commands::Detect { image } => {
            let faces = service.detect(&ImageInput::Path(image))?;
            print_json(&faces)?;
        }
        Commands::Enroll {
            group,
            key,
            bulk,
            images,
        } => {
            let strictness = if bulk {
                service.config().bulk_strictness()
            } else {
                Strictness::Interactive
            };
            let images: Vec<ImageInput> = images.into_iter().map(ImageInput::Path).collect();
            let enrollment = service.enroll(&group.store_id()?, &key, &images, strictness)?;
            println!(
                "Enrolled {key} from {} image(s), {} skipped",
                enrollment.images_used,
                enrollment.skipped.len()
            );
        }
        Commands::EnrollDir { group, key, dir } => {
            let enrollment = service.enroll_from_dir(&group.store_id()?, &key, &dir)?;
            println!(
                "Enrolled {key} from {} image(s), {} skipped",
                enrollment.images_used,
                enrollment.skipped.len()
            );
        }
        Commands::EnrollGroup { group, merge, dir } => {
            let requests = group_requests(&dir)?;
            let write = if merge { BatchWrite::Merge } else { BatchWrite::Replace };
            let report = service.enroll_batch(&group.store_id()?, requests, service.config().bulk_strictness(), write)?;
            print_json(&report)?;
            if !report.saved {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Recognize { group, image } => {
            let matches = service.recognize(&group.store_id()?, &ImageInput::Path(image))?;
            print_json(&matches)?;
        }
        Commands::Verify { group, key, image } => {
            let outcome = service.verify(&group.store_id()?, &key, &ImageInput::Path(image))?;
            print_json(&outcome)?;
            if !outcome.is_match() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Transfer {
            key,
            from_owner,
            from_group,
            to_owner,
            to_group,
        } => {
            let from = match (from_owner, from_group) {
                (Some(owner), Some(group)) => Some(StoreId::new(owner, group)?),
                _ => None,
            };
            let to = StoreId::new(to_owner, to_group)?;
            service.transfer_identity(&key, from.as_ref(), &to)?;
            println!("Transferred {key} to {to}");
        }
        Commands::List { group } => {
            let keys = service.list_identities(&group.store_id()?)?;
            if keys.is_empty() {
                println!("No identities enrolled");
            }
            for key in keys {
                println!("{key}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_service(cli: &Cli) -> Result<RecognitionService> {
    let model_dir = cli.model_dir.clone().unwrap_or_else(rollcall_core::default_model_dir);
    let store_dir = cli.store_dir.clone().unwrap_or_else(rollcall_core::default_store_dir);
    RecognitionService::load(&ModelPaths::in_dir(&model_dir), &store_dir, recognition_config(cli))
        .with_context(|| format!("loading models from {}", model_dir.display()))
}

fn recognition_config(cli: &Cli) -> RecognitionConfig {
    RecognitionConfig {
        similarity_threshold: cli.threshold,
        detection_threshold: cli.detection_threshold,
        enroll_confidence_floor: cli.enroll_floor,
        probe_confidence_floor: cli.verify_floor,
        verify_scope: match cli.scope {
            Scope::ClaimedGroup => VerifyScope::ClaimedGroup,
            Scope::AllGroups => VerifyScope::AllGroups,
        },
        key_scheme: if cli.numeric_ids {
            KeyScheme::NumericId
        } else {
            KeyScheme::Name
        },
    }
}

/// One request per subdirectory, keyed by the subdirectory name.
fn group_requests(dir: &Path) -> Result<Vec<EnrollmentRequest>> {
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();
    if subdirs.is_empty() {
        bail!("no identity directories in {}", dir.display());
    }

    let mut requests = Vec::with_capacity(subdirs.len());
    for sub in subdirs {
        let Some(key) = sub.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(dir = %sub.display(), "skipping directory with non-UTF-8 name");
            continue;
        };
        requests.push(EnrollmentRequest {
            key: key.to_string(),
            images: enrollment_images(&sub)?,
        });
    }
    Ok(requests)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
