//! Auction harvester CLI
//!
//! Local execution entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use harvester::{
    error::{AppError, Result},
    fetch::{EscalatingFetcher, Fetcher},
    models::{Config, ScrapeStatus, SiteRegistry},
    pipeline::{
        EnrichmentQueue, HarvestOrchestrator, HarvestReport, HarvestRequest, LinkHealthChecker,
        RediscoveryAction,
    },
    services::{LinkMatcher, NominatimGeocoder, StructureDiscovery},
    storage::{LocalStorage, PropertyStore, SiteStore, seed_sites},
    utils::log::{self as report, Mark},
};
use tokio_util::sync::CancellationToken;

/// Auction harvester - real-estate auction listing collector
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Harvests real-estate auction listings from auction-house sites"
)]
struct Cli {
    /// Directory holding config.toml, sites.toml and the data tables
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest enabled sites into the store
    Harvest {
        /// Harvest a single site
        #[arg(long)]
        site: Option<String>,

        /// Sites harvested at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-site item cap
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Geocode pending listings
    Enrich {
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_batches: Option<usize>,

        /// Keep going until the backlog is empty (bounded by --max-batches)
        #[arg(long)]
        all: bool,
    },

    /// Run structure discovery on one site and print the result
    Discover {
        site: String,

        /// Store the discovered method on the site
        #[arg(long)]
        save: bool,
    },

    /// Revalidate sites that keep failing or stopped changing
    Rediscover,

    /// Probe stored listing URLs and retire the ones that are gone
    SweepLinks {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate configuration files
    Validate,

    /// Show store and site status
    Info,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, config_level: &str) {
    let level = if verbose { "debug" } else { config_level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
    report::init(level);
}

/// Cancel the token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, finishing in-flight pages...");
            token.cancel();
        }
    });
    cancel
}

/// Open the store and import sites the registry adds.
async fn open_storage(data_dir: &Path) -> Result<Arc<LocalStorage>> {
    let storage = Arc::new(LocalStorage::open(data_dir).await?);
    let registry_path = data_dir.join("sites.toml");
    if registry_path.exists() {
        let registry = SiteRegistry::load(&registry_path)?;
        seed_sites(storage.as_ref(), &registry).await?;
    } else {
        log::warn!("No site registry at {}", registry_path.display());
    }
    Ok(storage)
}

fn print_harvest(harvest: &HarvestReport) {
    for site in &harvest.sites {
        let mark = if site.error.is_some() {
            Mark::Fail
        } else if site.cancelled {
            Mark::Idle
        } else if !site.complete {
            Mark::Warn
        } else {
            Mark::Ok
        };
        report::site(
            mark,
            &site.site_id,
            &format!(
                "{}: {} extracted, {} new, {} updated, {} retired{}",
                site.status,
                site.extracted,
                site.stats.new,
                site.stats.updated,
                site.retired,
                if site.cancelled { " (cancelled)" } else { "" }
            ),
        );
    }
    for error in &harvest.errors {
        report::error(&format!(
            "{}: {} ({})",
            error.site_id, error.message, error.diagnosis
        ));
    }
    report::summary(
        "Harvest",
        &[
            ("Sites attempted", harvest.attempted.to_string()),
            ("Succeeded", harvest.succeeded.to_string()),
            ("Failed", harvest.failed.to_string()),
            ("Extracted", harvest.extracted().to_string()),
            ("New", harvest.totals.new.to_string()),
            ("Updated", harvest.totals.updated.to_string()),
            ("Skipped", harvest.totals.skipped.to_string()),
            ("Retired", harvest.retired.to_string()),
            (
                "Duration",
                format!(
                    "{}s",
                    (harvest.finished_at - harvest.started_at).num_seconds()
                ),
            ),
        ],
    );
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.data_dir.join("config.toml");
    let config = Config::load_or_default(&config_path);
    init_logging(cli.verbose, &config.logging.level);

    log::info!("Loaded configuration from {}", cli.data_dir.display());
    config.validate()?;
    let config = Arc::new(config);

    match cli.command {
        Command::Harvest {
            site,
            concurrency,
            max_items,
        } => {
            report::header("Harvest");
            let storage = open_storage(&cli.data_dir).await?;
            let fetcher: Arc<dyn Fetcher> = Arc::new(EscalatingFetcher::from_config(&config.fetch)?);
            let orchestrator = HarvestOrchestrator::new(
                Arc::clone(&config),
                storage.clone(),
                storage.clone(),
                Arc::clone(&fetcher),
            )?;

            let request = HarvestRequest {
                site_id: site,
                concurrency,
                max_items,
            };
            let result = orchestrator.run_batch(request, cancel_on_ctrl_c()).await;
            fetcher.shutdown().await;
            storage.flush().await?;
            let harvest = result?;

            print_harvest(&harvest);
            if harvest.cancelled {
                report::warn("Harvest cancelled; partial results were saved");
            } else {
                report::success("Harvest complete!");
            }
        }

        Command::Enrich {
            batch_size,
            max_batches,
            all,
        } => {
            report::header("Enrichment");
            let storage = open_storage(&cli.data_dir).await?;
            let geocoder = Arc::new(NominatimGeocoder::new(&config.enrichment)?);
            let queue = EnrichmentQueue::new(storage.clone(), geocoder, config.enrichment.clone());

            let batch_size = batch_size.unwrap_or(config.enrichment.batch_size);
            let result = if all || max_batches.is_some() {
                let max_batches = max_batches.unwrap_or(config.enrichment.max_batches);
                queue.process_all(batch_size, max_batches).await
            } else {
                queue.process_pending_batch(batch_size).await
            };
            storage.flush().await?;
            let stats = result?;

            report::summary(
                "Enrichment",
                &[
                    ("Processed", stats.processed.to_string()),
                    ("Located", stats.success.to_string()),
                    ("Failed", stats.failed.to_string()),
                    ("Skipped", stats.skipped.to_string()),
                ],
            );
        }

        Command::Discover { site, save } => {
            report::header(&format!("Discover {}", site));
            let storage = open_storage(&cli.data_dir).await?;
            let mut site_config = storage
                .get_site(&site)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("site {site}")))?;

            let fetcher: Arc<dyn Fetcher> = Arc::new(EscalatingFetcher::from_config(&config.fetch)?);
            let links = LinkMatcher::new(&config.discovery.link_patterns)?;
            let discovery =
                StructureDiscovery::new(Arc::clone(&fetcher), links, config.discovery.clone());
            let result = discovery.discover(&site_config).await;
            fetcher.shutdown().await;
            let result = result?;

            report::sub_item(&format!("Type: {:?}", result.site_type));
            report::sub_item(&format!("Layer: {}", result.layer_used));
            report::sub_item(&format!(
                "Cards: {} (confidence {:.2})",
                result.element_count, result.confidence
            ));
            report::sub_item(&format!("Pagination: {:?}", result.pagination));
            for candidate in result.candidates.iter().take(5) {
                report::sub_item(&format!(
                    "  {} -> {} card(s), confidence {:.2}",
                    candidate.selector, candidate.count, candidate.confidence
                ));
            }
            for hint in &result.api_hints {
                report::sub_item(&format!("API hint: {}", hint));
            }

            match result.to_method() {
                Some(method) if save && result.is_usable(config.discovery.min_confidence) => {
                    site_config.method = Some(method);
                    storage.save_site(&site_config).await?;
                    report::success(&format!("Saved discovered method for {}", site));
                }
                _ if save => {
                    report::warn("Result below the confidence threshold; nothing saved");
                }
                _ => {}
            }
        }

        Command::Rediscover => {
            report::header("Rediscovery");
            let storage = open_storage(&cli.data_dir).await?;
            let fetcher: Arc<dyn Fetcher> = Arc::new(EscalatingFetcher::from_config(&config.fetch)?);
            let orchestrator = HarvestOrchestrator::new(
                Arc::clone(&config),
                storage.clone(),
                storage.clone(),
                Arc::clone(&fetcher),
            )?;

            let outcomes = orchestrator.run_rediscovery(cancel_on_ctrl_c()).await;
            fetcher.shutdown().await;
            let outcomes = outcomes?;
            for outcome in &outcomes {
                let mark = match outcome.action {
                    RediscoveryAction::Retained | RediscoveryAction::Replaced => Mark::Ok,
                    RediscoveryAction::Drift => Mark::Warn,
                    RediscoveryAction::Failed => Mark::Fail,
                    RediscoveryAction::Skipped => Mark::Idle,
                };
                report::site(
                    mark,
                    &outcome.site_id,
                    &format!(
                        "{:?}{}",
                        outcome.action,
                        outcome
                            .diagnosis
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default()
                    ),
                );
            }
            report::success(&format!("Rediscovered {} site(s)", outcomes.len()));
        }

        Command::SweepLinks { limit } => {
            report::header("Link sweep");
            let storage = open_storage(&cli.data_dir).await?;
            let fetcher: Arc<dyn Fetcher> = Arc::new(EscalatingFetcher::from_config(&config.fetch)?);
            let checker =
                LinkHealthChecker::new(storage.clone(), Arc::clone(&fetcher), config.link_health.clone());

            let result = checker
                .sweep(limit.unwrap_or(config.link_health.batch_size))
                .await;
            fetcher.shutdown().await;
            storage.flush().await?;
            let stats = result?;

            report::summary(
                "Link sweep",
                &[
                    ("Checked", stats.checked.to_string()),
                    ("Deactivated", stats.deactivated.to_string()),
                    ("Healthy", stats.healthy.to_string()),
                    ("Inconclusive", stats.inconclusive.to_string()),
                ],
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            log::info!("✓ Config OK");

            let registry_path = cli.data_dir.join("sites.toml");
            match SiteRegistry::load(&registry_path) {
                Ok(registry) => {
                    log::info!("✓ Site registry OK ({} sites)", registry.sites.len());
                }
                Err(e) => {
                    log::error!("Site registry validation failed: {}", e);
                    return Err(e);
                }
            }

            log::info!("All validations passed!");
        }

        Command::Info => {
            let storage = open_storage(&cli.data_dir).await?;
            log::info!("Data directory: {}", storage.root_dir().display());

            let sites = storage.list_sites().await?;
            let enabled = sites.iter().filter(|s| s.enabled).count();
            report::header("Sites");
            for site in &sites {
                let state = storage.get_run_state(&site.site_id).await?;
                let status = state
                    .as_ref()
                    .map(|s| s.status.to_string())
                    .unwrap_or_else(|| "never run".to_string());
                let count = storage.count_active(Some(&site.site_id)).await?;
                let mark = match state.as_ref().map(|s| s.status) {
                    _ if !site.enabled => Mark::Fail,
                    Some(ScrapeStatus::Success) => Mark::Ok,
                    Some(ScrapeStatus::Error | ScrapeStatus::NeedsPlaywright) => Mark::Warn,
                    _ => Mark::Idle,
                };
                report::site(
                    mark,
                    &site.site_id,
                    &format!(
                        "[{}] {} - {} active{}",
                        site.method.as_ref().map_or("undiscovered", |m| m.name()),
                        status,
                        count,
                        if site.enabled { "" } else { " (disabled)" }
                    ),
                );
            }

            let all = storage.all().await?;
            let geocoded = all.iter().filter(|p| p.has_coordinates()).count();
            report::summary(
                "Store",
                &[
                    ("Sites", format!("{} ({} enabled)", sites.len(), enabled)),
                    ("Active listings", storage.count_active(None).await?.to_string()),
                    ("Total listings", all.len().to_string()),
                    ("Geocoded", geocoded.to_string()),
                ],
            );
        }
    }

    log::info!("Done!");

    Ok(())
}
