use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod cluster;
mod db;
mod error;
mod models;
mod pairs;
mod profile;
mod report;
mod stats;

#[derive(Parser)]
#[command(name = "submission-integrity")]
#[command(about = "Statistical outlier detection over submission similarity data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small deterministic demo dataset
    Seed,
    /// Import similarity facts from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Generate the statistical report for one assignment
    Report {
        #[arg(long)]
        assignment: Uuid,
        #[arg(long, default_value_t = 2.0)]
        cutoff: f64,
    },
    /// Re-run outlier flagging against an assignment's current report
    Flag {
        #[arg(long)]
        assignment: Uuid,
        #[arg(long)]
        professor: Uuid,
        #[arg(long, default_value_t = 2.0)]
        cutoff: f64,
    },
    /// Rebuild the per-student-pair aggregate table for a course offering
    PairStats {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        semester: Uuid,
    },
    /// Recompute per-student semester profiles
    Profiles {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        semester: Uuid,
        #[arg(long, default_value_t = 2.0)]
        z_threshold: f64,
    },
    /// Cluster semester profiles into ordered risk tiers
    Cluster {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        semester: Uuid,
        #[arg(long, default_value_t = 6)]
        max_k: usize,
        #[arg(long, default_value_t = 10)]
        b_refs: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run the whole pipeline for a course offering: reports, flags,
    /// pair stats, profiles and clustering
    Analyze {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        semester: Uuid,
        #[arg(long, default_value_t = 2.0)]
        cutoff: f64,
        #[arg(long, default_value_t = 2.0)]
        z_threshold: f64,
        #[arg(long, default_value_t = 6)]
        max_k: usize,
        #[arg(long, default_value_t = 10)]
        b_refs: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "submission_integrity=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(default_workers().max(5) as u32)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} similarity facts from {}.", csv.display());
        }
        Commands::Report { assignment, cutoff } => {
            let outcome = report::generate_report(&pool, assignment, cutoff).await?;
            println!(
                "Report {} for assignment {}: mu={:.2} sigma={:.2} across {} submissions, {} flags",
                outcome.report.id,
                assignment,
                outcome.report.mu,
                outcome.report.sigma,
                outcome.students,
                outcome.flags_created,
            );
        }
        Commands::Flag {
            assignment,
            professor,
            cutoff,
        } => {
            let created = report::flag_student_pairs(&pool, assignment, professor, cutoff).await?;
            println!("Created {created} flags for assignment {assignment} at cutoff {cutoff}.");
        }
        Commands::PairStats { course, semester } => {
            let facts = db::fetch_scope_facts(&pool, course, semester).await?;
            let flagged = db::fetch_flag_evidence(&pool, course, semester).await?;
            let rows = pairs::rebuild_pair_stats(&pool, course, semester, &facts, &flagged).await?;
            println!("Rebuilt {rows} pair-stat rows for {course}/{semester}.");
        }
        Commands::Profiles {
            course,
            semester,
            z_threshold,
        } => {
            let count = profile::recompute_profiles(&pool, course, semester, z_threshold).await?;
            println!("Recomputed {count} semester profiles for {course}/{semester}.");
        }
        Commands::Cluster {
            course,
            semester,
            max_k,
            b_refs,
            seed,
        } => {
            let cfg = cluster::ClusterConfig {
                max_k,
                b_refs,
                seed,
                ..cluster::ClusterConfig::default()
            };
            match cluster::cluster_profiles(&pool, course, semester, &cfg).await? {
                Some(k) => println!("Clustered {course}/{semester} into {k} risk tiers."),
                None => println!("No profiles to cluster for {course}/{semester}."),
            }
        }
        Commands::Analyze {
            course,
            semester,
            cutoff,
            z_threshold,
            max_k,
            b_refs,
            seed,
            workers,
        } => {
            let workers = workers.unwrap_or_else(default_workers);
            let summary =
                report::generate_for_course_semester(&pool, course, semester, cutoff, workers)
                    .await?;
            println!(
                "Reports: {}/{} generated ({} skipped), {} flags, {} pair-stat rows.",
                summary.reports,
                summary.assignments,
                summary.skipped,
                summary.flags_created,
                summary.pair_rows,
            );

            let profiles =
                profile::recompute_profiles(&pool, course, semester, z_threshold).await?;
            println!("Recomputed {profiles} semester profiles.");

            let cfg = cluster::ClusterConfig {
                max_k,
                b_refs,
                seed,
                ..cluster::ClusterConfig::default()
            };
            match cluster::cluster_profiles(&pool, course, semester, &cfg).await? {
                Some(k) => println!("Clustered students into {k} risk tiers."),
                None => println!("No profiles to cluster."),
            }
        }
    }

    Ok(())
}
