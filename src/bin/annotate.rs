use anyhow::{bail, Result};
use clap::Parser;
use image_annotator::output;
use image_annotator::storage::StorageClient;
use image_annotator::vision::{Feature, FeatureKind, FeatureSpec, VisionClient};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, process};
use tokio::time::Instant;
use tracing::info;

/// Uploads a local image to a Cloud Storage bucket and prints the vision
/// service's annotations for it.
#[derive(Debug, Parser)]
#[command(name = "annotate")]
struct Args {
    /// Bucket to upload the image to
    #[arg(short, long)]
    bucket: String,

    /// Local image file to annotate
    #[arg(short, long)]
    image: PathBuf,

    /// Timeout for all remote calls (e.g. 30s, 1m30s)
    #[arg(short, long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Maximum number of results per feature
    #[arg(short, long, default_value_t = 3)]
    maxresults: i32,

    /// Features to request, each optionally with its own result cap
    /// (e.g. label=8,text=4). Defaults to all features at --maxresults.
    #[arg(short, long, value_delimiter = ',')]
    features: Option<Vec<FeatureSpec>>,

    /// Dump the full annotation response as JSON instead of the summary
    #[arg(long)]
    raw: bool,
}

fn resolve_features(specs: Option<Vec<FeatureSpec>>, max_results: i32) -> Result<Vec<Feature>> {
    let specs = specs.unwrap_or_else(|| {
        FeatureKind::ALL
            .iter()
            .map(|&kind| FeatureSpec {
                kind,
                max_results: None,
            })
            .collect()
    });

    let mut features: Vec<Feature> = Vec::with_capacity(specs.len());
    for spec in specs {
        if features.iter().any(|f| f.kind == spec.kind) {
            bail!("feature {} given more than once", spec.kind);
        }
        features.push(Feature {
            kind: spec.kind,
            max_results: spec.max_results.unwrap_or(max_results),
        });
    }
    Ok(features)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();
    if args.bucket.is_empty() {
        println!("No bucket given!");
        process::exit(2);
    }
    if args.image.as_os_str().is_empty() {
        println!("No image file given!");
        process::exit(2);
    }
    let features = resolve_features(args.features, args.maxresults)?;

    let deadline = Instant::now() + args.timeout;

    let storage = StorageClient::new(env::var("GOOGLE_ACCESS_TOKEN").ok());
    let uri = storage.upload(&args.image, &args.bucket, deadline).await?;
    info!(%uri, "image uploaded");

    let vision = VisionClient::new(env::var("GOOGLE_API_KEY").ok());
    let response = vision.annotate(&uri, &features, deadline).await?;

    let mut stdout = io::stdout().lock();
    if args.raw {
        output::print_raw(&mut stdout, &response)?;
    } else {
        output::print_results(&mut stdout, &features, &response)?;
    }
    Ok(())
}
