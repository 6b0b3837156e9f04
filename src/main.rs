//! archive-cache: operator tool for a disk cache in front of a long-term
//! archive.
//!
//! Opens the inventory, attaches the configured volumes and runs one
//! administrative command: list volumes, sweep for corrupted or expired
//! objects, restore or uncache an object, change a volume's status, or dump
//! metrics.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use archive_cache::cache::{Cache, DeletionPlanner, VolumeConfig};
use archive_cache::checksum::{CRC32, SHA256};
use archive_cache::config::{CheckKind, Cli, Command, Config, RestoreKind};
use archive_cache::integrity::{
    CacheObjectCheck, ChecksumCheck, ExpiryCheck, IntegrityMonitor, SizeCheck,
};
use archive_cache::inventory::{Catalog, SharedCatalog};
use archive_cache::manager::CacheManager;
use archive_cache::metrics::CacheMetrics;
use archive_cache::restore::{FileCopyRestorer, Restorer, ZipFileRestorer, ZipRepoRestorer};
use archive_cache::storage::FilesystemLongTermStorage;
use archive_cache::volume::FilesystemVolume;

fn build_checks(config: &Config, catalog: &SharedCatalog) -> Vec<Arc<dyn CacheObjectCheck>> {
    config
        .integrity
        .checks
        .iter()
        .map(|kind| -> Arc<dyn CacheObjectCheck> {
            match kind {
                CheckKind::Size => Arc::new(SizeCheck),
                CheckKind::Checksum => Arc::new(ChecksumCheck::default()),
                CheckKind::Expiry => Arc::new(ExpiryCheck::with_ttl(
                    catalog.clone(),
                    config.integrity.expiry_ttl(),
                )),
            }
        })
        .collect()
}

fn build_restorer(config: &Config) -> anyhow::Result<Arc<dyn Restorer>> {
    let root = config.restore.root.clone();
    let restorer: Arc<dyn Restorer> = match config.restore.kind {
        RestoreKind::FileCopy => {
            Arc::new(FileCopyRestorer::new(Arc::new(FilesystemLongTermStorage::new(root))))
        }
        RestoreKind::ZipFile => {
            let archive = config
                .restore
                .archive
                .clone()
                .context("restore.archive is required for a zip_file restorer")?;
            Arc::new(ZipFileRestorer::with_prefix(
                Arc::new(FilesystemLongTermStorage::new(root)),
                archive,
                config.restore.prefix.clone().unwrap_or_default(),
            ))
        }
        RestoreKind::ZipRepo => Arc::new(ZipRepoRestorer::new(root)),
    };
    Ok(restorer)
}

async fn build_cache(
    config: &Config,
    catalog: SharedCatalog,
    metrics: CacheMetrics,
) -> anyhow::Result<Cache> {
    let tuning = config.eviction.tuning();
    let strategy = Arc::from(config.eviction.strategy.build(&tuning));
    let planner = DeletionPlanner::new(catalog.clone(), strategy).with_headroom(
        config.eviction.selection_headroom,
        config.eviction.deletion_headroom,
    );
    let mut cache = Cache::new(config.name.clone(), catalog.clone(), planner).with_metrics(metrics);

    for vs in &config.volumes {
        let volume = FilesystemVolume::new(vs.name.clone(), vs.path.clone())
            .await
            .with_context(|| format!("opening volume {} at {}", vs.name, vs.path.display()))?;
        let mut vc = VolumeConfig::default().with_roles(vs.roles);
        vc.status = vs.status;
        if let Some(kind) = vs.strategy {
            vc = vc.with_strategy(Arc::from(kind.build(&tuning)));
        }
        cache.add_cache_volume(Arc::new(volume), vs.capacity, None, vc, true)?;
    }

    if config.integrity.verify_on_save {
        let checks: Vec<Arc<dyn CacheObjectCheck>> =
            vec![Arc::new(SizeCheck), Arc::new(ChecksumCheck::default())];
        let checker = cache.integrity_monitor(checks);
        cache.set_checker(Some(Arc::new(checker)));
    }
    Ok(cache)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "archive_cache=debug"
    } else {
        "archive_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("archive-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        inventory = %config.inventory.path.display(),
        volumes = config.volumes.len(),
        capacity = config.total_capacity(),
        "Configuration loaded"
    );

    let catalog: SharedCatalog = Arc::new(
        Catalog::open(&config.inventory.path)
            .context("opening inventory")?
            .with_check_grace(config.integrity.check_grace()),
    );
    for alg in [SHA256, CRC32] {
        catalog.register_algorithm(alg)?;
    }
    let metrics = CacheMetrics::new()?;
    let cache = build_cache(&config, catalog.clone(), metrics.clone()).await?;

    match cli.command {
        Command::Volumes => {
            cache.record_space()?;
            for info in catalog.volume_infos()? {
                let used = catalog.used_space_in(&info.name)?;
                let avail = catalog.available_space_in(&info.name)?;
                println!(
                    "{:<20} {:<10} roles={:#06x} capacity={:<14} used={:<14} available={}",
                    info.name, info.status, info.roles, info.capacity, used, avail
                );
            }
        }
        Command::Sweep { limit, dry_run } => {
            let monitor = cache
                .integrity_monitor(build_checks(&config, &catalog))
                .with_fail_limit(config.integrity.fail_limit);
            let limit = limit.unwrap_or(config.integrity.sample_limit);
            let mut failed = Vec::new();
            let passed = monitor
                .find_corrupted_objects(limit, &mut failed, !dry_run)
                .await?;
            for obj in &failed {
                println!("FAILED {} ({})", obj.location(), obj.id.as_deref().unwrap_or("-"));
            }
            println!("passed={passed} failed={}", failed.len());
        }
        Command::Restore { id, recache } => {
            let restorer = build_restorer(&config)?;
            if restorer.does_not_exist(&id).await? {
                warn!(id = %id, "not found in long-term storage");
            }
            let mgr = CacheManager::new(Arc::new(cache), restorer).with_roles(config.restore.roles);
            if mgr.cache(&id, recache).await? {
                println!("restored {id}");
            } else {
                println!("{id} already cached");
            }
        }
        Command::Uncache { id } => {
            let removed = cache.uncache(&id).await?;
            println!("removed {removed} cached copies of {id}");
        }
        Command::Status { volume, status } => {
            let before = catalog.volume_status(&volume)?;
            catalog.set_volume_status(&volume, status)?;
            println!("{volume}: {before} -> {status}");
        }
        Command::Metrics => {
            cache.record_space()?;
            print!("{}", metrics.render());
        }
    }

    Ok(())
}
