use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{self, MergeMode, MergeReport};
use crate::cli::RestaurantArgs;
use crate::config::{DataLayout, HttpConfig};
use crate::dedup::{DedupStore, LocalFsDedupStore};
use crate::error::{HarvestError, is_fatal};
use crate::formats::{RestaurantTarget, ReviewRecord, city_key};
use crate::http::HttpFetcher;
use crate::partial::{partial_path, write_partial};
use crate::pool::WorkerPool;
use crate::site::{CityResolver, HttpSite, RestaurantCatalog, RestaurantHarvester};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestaurantOutcome {
    AlreadySeen,
    InFlight,
    NoReviews,
    Stored { reviews: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityReport {
    pub city_key: String,
    pub restaurants: usize,
    pub stored: usize,
    pub no_reviews: usize,
    pub skipped: usize,
    pub failed: usize,
    pub merge: MergeReport,
    pub output: PathBuf,
}

pub struct RestaurantPipeline {
    resolver: Arc<dyn CityResolver>,
    catalog: Arc<dyn RestaurantCatalog>,
    harvester: Arc<dyn RestaurantHarvester>,
    store: Arc<dyn DedupStore>,
    pool: WorkerPool,
    layout: DataLayout,
    merge_mode: MergeMode,
}

impl RestaurantPipeline {
    pub fn new(
        resolver: Arc<dyn CityResolver>,
        catalog: Arc<dyn RestaurantCatalog>,
        harvester: Arc<dyn RestaurantHarvester>,
        store: Arc<dyn DedupStore>,
        pool: WorkerPool,
        layout: DataLayout,
    ) -> Self {
        Self {
            resolver,
            catalog,
            harvester,
            store,
            pool,
            layout,
            merge_mode: MergeMode::default(),
        }
    }

    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }

    /// Resolve, fan out over the catalog, then merge the city's partial files.
    ///
    /// Merging only happens once every worker has finished and nothing was cancelled;
    /// otherwise the staging directory is left as it is for the next run.
    pub async fn harvest_city(
        &self,
        city: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<CityReport> {
        let key = city_key(city);
        let target = self
            .resolver
            .resolve(&key)
            .await
            .with_context(|| format!("resolve city: {key}"))?;
        let Some(listing_address) = target.listing_address else {
            return Err(HarvestError::CityNotFound { city: key }.into());
        };
        tracing::info!(city = %key, listing = %listing_address, "getting restaurants");

        let restaurants = self
            .catalog
            .restaurants(&listing_address)
            .await
            .with_context(|| format!("fetch restaurant catalog: {listing_address}"))?;
        tracing::info!(city = %key, total = restaurants.len(), "restaurants in catalog");

        let staging_dir = self.layout.staging_dir(&key);
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .with_context(|| format!("create staging dir: {}", staging_dir.display()))?;

        let worker = Arc::new(CityWorker {
            harvester: Arc::clone(&self.harvester),
            store: Arc::clone(&self.store),
            city_key: key.clone(),
            staging_dir: staging_dir.clone(),
            in_flight: Mutex::new(HashSet::new()),
            tally: Tally::default(),
        });

        let total = restaurants.len();
        let pool_report = self
            .pool
            .run(restaurants, cancel, |target| {
                let worker = Arc::clone(&worker);
                async move { worker.process(target).await.map(|_| ()) }
            })
            .await;

        if let Some(fatal) = pool_report.fatal {
            return Err(fatal.context(format!("harvest {key}")));
        }
        if cancel.is_cancelled() || pool_report.not_started > 0 {
            tracing::warn!(
                city = %key,
                staging = %staging_dir.display(),
                "run interrupted; keeping partial files for the next run"
            );
            return Err(HarvestError::Cancelled.into());
        }

        let output = self.layout.city_output(&key);
        let merge = {
            let staging_dir = staging_dir.clone();
            let output = output.clone();
            let mode = self.merge_mode;
            tokio::task::spawn_blocking(move || {
                aggregate::merge_with(&staging_dir, &output, mode)
            })
                .await
                .context("join merge task")??
        };

        Ok(CityReport {
            city_key: key,
            restaurants: total,
            stored: worker.tally.stored.load(Ordering::Relaxed),
            no_reviews: worker.tally.no_reviews.load(Ordering::Relaxed),
            skipped: worker.tally.skipped.load(Ordering::Relaxed),
            failed: pool_report.failed,
            merge,
            output,
        })
    }

    /// Cities run one after another. A city that fails is reported and the batch moves
    /// on, unless the failure is fatal; the result is an error if any city failed.
    pub async fn run_batch(
        &self,
        cities: &[String],
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<CityReport>> {
        let mut reports = Vec::with_capacity(cities.len());
        let mut failed = 0_usize;

        for city in cities {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled.into());
            }
            match self.harvest_city(city, cancel).await {
                Ok(report) => {
                    println!(
                        "{}: {} records -> {}",
                        report.city_key,
                        report.merge.records,
                        report.output.display()
                    );
                    tracing::info!(
                        city = %report.city_key,
                        restaurants = report.restaurants,
                        stored = report.stored,
                        no_reviews = report.no_reviews,
                        skipped = report.skipped,
                        failed = report.failed,
                        records = report.merge.records,
                        "city done"
                    );
                    reports.push(report);
                }
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => {
                    tracing::error!(city = %city, err = %format!("{err:#}"), "city failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} of {} cities failed", cities.len());
        }
        Ok(reports)
    }
}

#[derive(Debug, Default)]
struct Tally {
    stored: AtomicUsize,
    no_reviews: AtomicUsize,
    skipped: AtomicUsize,
}

/// Everything one city's workers share. Each worker only writes its own partial file.
struct CityWorker {
    harvester: Arc<dyn RestaurantHarvester>,
    store: Arc<dyn DedupStore>,
    city_key: String,
    staging_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
    tally: Tally,
}

impl CityWorker {
    async fn process(&self, target: RestaurantTarget) -> anyhow::Result<RestaurantOutcome> {
        let restaurant = self
            .harvester
            .identify(&target)
            .await
            .with_context(|| format!("identify restaurant: {}", target.address))?;
        let name = restaurant.identity.name.as_str();

        let Some(_claim) = self.claim(name) else {
            tracing::info!(restaurant = %name, "same restaurant already in progress; skipping");
            self.tally.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(RestaurantOutcome::InFlight);
        };

        let seen = self
            .store
            .is_member(&self.city_key, name)
            .await
            .map_err(HarvestError::store)?;
        if seen {
            tracing::info!(restaurant = %name, "already downloaded; skipping");
            self.tally.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(RestaurantOutcome::AlreadySeen);
        }

        tracing::info!(restaurant = %name, "getting reviews");
        let reviews = self
            .harvester
            .reviews(&restaurant)
            .await
            .with_context(|| format!("fetch reviews for {name}: {}", target.address))?;

        let outcome = if reviews.is_empty() {
            tracing::info!(restaurant = %name, "no reviews");
            self.tally.no_reviews.fetch_add(1, Ordering::Relaxed);
            RestaurantOutcome::NoReviews
        } else {
            let count = reviews.len();
            let records: Vec<ReviewRecord> = reviews
                .into_iter()
                .map(|review| ReviewRecord::new(&self.city_key, name, review))
                .collect();
            let path = partial_path(&self.staging_dir, &restaurant.identity);
            tracing::info!(restaurant = %name, reviews = count, "storing reviews");
            tokio::task::spawn_blocking(move || write_partial(&path, &records))
                .await
                .context("join partial writer")??;
            self.tally.stored.fetch_add(1, Ordering::Relaxed);
            RestaurantOutcome::Stored { reviews: count }
        };

        self.store
            .add(&self.city_key, name)
            .await
            .map_err(HarvestError::store)?;
        Ok(outcome)
    }

    fn claim(&self, name: &str) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(name.to_owned()).then(|| Claim {
            in_flight: &self.in_flight,
            name: name.to_owned(),
        })
    }
}

/// Holds a restaurant name in the in-flight set until dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

pub async fn run(args: RestaurantArgs) -> anyhow::Result<()> {
    let http = HttpConfig::from_env()
        .context("load http config")?
        .with_delay_ms(args.site.delay_ms);
    let fetcher = HttpFetcher::new(http)?;
    let site = Arc::new(HttpSite::new(fetcher, &args.site.base_url)?);
    let layout = DataLayout::new(&args.site.data_dir);
    let store_dir = args
        .store_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.default_store_dir());
    tracing::debug!(store = %store_dir.display(), "using local dedup store");

    let pipeline = RestaurantPipeline::new(
        site.clone(),
        site.clone(),
        site,
        Arc::new(LocalFsDedupStore::new(store_dir)),
        WorkerPool::new(args.concurrency),
        layout,
    )
    .with_merge_mode(if args.append {
        MergeMode::Append
    } else {
        MergeMode::Replace
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; letting in-flight restaurants finish");
                cancel.cancel();
            }
        }
    });

    pipeline.run_batch(&args.cities, &cancel).await?;
    Ok(())
}
