use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use leadm_core::{Lead, LeadBatch, LeadFilter, Session, SessionEvent};
use leadm_sync::{Dashboard, DraftResult};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Parser)]
#[command(name = "leadm")]
#[command(about = "Lead Machine: scrape local businesses, review them and sync them to the CRM sheet")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON dashboard API.
    Serve,
    /// Run a directory search.
    Search {
        query: String,
        #[arg(long)]
        max_results: Option<u32>,
        #[command(flatten)]
        output: ResultArgs,
    },
    /// List recent successful searches.
    History,
    /// Reload the dataset of a past search.
    Load {
        dataset_id: String,
        #[arg(long)]
        label: Option<String>,
        #[command(flatten)]
        output: ResultArgs,
    },
    /// Show the CRM table, optionally filtered by free text.
    Crm {
        #[arg(long, short)]
        query: Option<String>,
    },
    /// Draft outreach emails for CRM rows that have none.
    Drafts,
}

#[derive(Debug, Args)]
struct ResultArgs {
    /// Keep only leads without a website.
    #[arg(long)]
    no_website: bool,
    /// Keep only leads rated below 4.5.
    #[arg(long)]
    low_rating: bool,
    /// Write the filtered leads to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Save the filtered leads as a timestamped CSV in LEADM_EXPORT_DIR.
    #[arg(long)]
    save: bool,
    /// Append the filtered leads to the CRM sheet.
    #[arg(long)]
    export: bool,
}

impl ResultArgs {
    fn filter(&self) -> LeadFilter {
        LeadFilter {
            no_website: self.no_website,
            low_rating: self.low_rating,
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("invalid log filter: {e}"))?;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    Registry::default().with(env_filter).with(console_layer).init();
    Ok(())
}

fn print_leads(leads: &[Lead]) {
    for lead in leads {
        println!(
            "{:<40} {:>4} {:>6}  {:<16} {}",
            lead.title.as_deref().unwrap_or("-"),
            lead.rating.map(|r| format!("{r:.1}")).unwrap_or_else(|| "-".into()),
            lead.review_count.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            lead.phone.as_deref().unwrap_or("-"),
            lead.website.as_deref().unwrap_or("(no website)"),
        );
    }
}

async fn handle_batch(dashboard: &Dashboard, batch: LeadBatch, output: &ResultArgs) -> Result<()> {
    let label = batch.origin.label().to_string();
    let session = Session::new().transition(SessionEvent::ResultsLoaded(batch));
    let Some(leads) = session.visible_leads(&output.filter()) else {
        warn!("no results found");
        return Ok(());
    };
    print_leads(&leads);
    println!("{} leads shown", leads.len());

    if let Some(path) = &output.csv {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        leadm_storage::write_leads_csv(BufWriter::new(file), &leads)?;
        println!("csv written: {}", path.display());
    }
    if output.save {
        let stored = dashboard.export_csv(&leads, &label).await?;
        println!(
            "csv saved: {} ({} rows)",
            stored.absolute_path.display(),
            stored.rows
        );
    }
    if output.export {
        let outcome = dashboard.export_to_crm(&leads).await?;
        println!("{}", outcome.message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let dashboard = Dashboard::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            leadm_web::serve(dashboard).await?;
        }
        Commands::Search {
            query,
            max_results,
            output,
        } => {
            let batch = dashboard.search(&query, max_results).await?;
            handle_batch(&dashboard, batch, &output).await?;
        }
        Commands::History => {
            for run in dashboard.history().await? {
                println!("{}  {}", run.dataset_id, run.label);
            }
        }
        Commands::Load {
            dataset_id,
            label,
            output,
        } => {
            let batch = dashboard.load_run(&dataset_id, label).await?;
            handle_batch(&dashboard, batch, &output).await?;
        }
        Commands::Crm { query } => {
            let view = dashboard.crm_view(query.as_deref().unwrap_or("")).await?;
            println!(
                "total leads: {}  average rating: {:.2}  refreshed: {}",
                view.summary.total_leads,
                view.summary.average_rating,
                view.summary.refreshed_at.format("%Y-%m-%d %H:%M:%S")
            );
            let counts: Vec<String> = view
                .status_breakdown
                .counts
                .iter()
                .map(|c| format!("{}: {}", c.status, c.count))
                .collect();
            println!(
                "{}  unrecognized: {}",
                counts.join("  "),
                view.status_breakdown.unrecognized
            );
            println!("{}", view.header.join(" | "));
            for record in &view.records {
                let cells: Vec<&str> = view
                    .header
                    .iter()
                    .map(|h| record.get(h).unwrap_or(""))
                    .collect();
                println!("{}", cells.join(" | "));
            }
        }
        Commands::Drafts => {
            let summary = dashboard
                .generate_drafts(|p| eprintln!("drafting {}/{} (row {})", p.completed, p.total, p.row))
                .await?;
            for outcome in &summary.outcomes {
                if let DraftResult::Failed { detail } = &outcome.result {
                    println!("row {}: draft failed: {detail}", outcome.row);
                }
            }
            println!(
                "drafted {}, failed {}, already drafted {}",
                summary.drafted(),
                summary.failed(),
                summary.already_drafted
            );
        }
    }

    Ok(())
}
