use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gather all restaurant reviews for the given cities.
    Restaurant(RestaurantArgs),
    /// Gather overall review counts for the given cities.
    Overall(OverallArgs),
}

#[derive(Debug, Args)]
pub struct SiteArgs {
    /// Output directory for staging, per-city and overall files.
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    /// Review site root (must be http/https).
    #[arg(long, default_value = "https://www.tripadvisor.com")]
    pub base_url: String,

    /// Delay before each request (politeness).
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,
}

#[derive(Debug, Args)]
pub struct RestaurantArgs {
    /// City names.
    #[arg(value_name = "CITY", required = true)]
    pub cities: Vec<String>,

    #[command(flatten)]
    pub site: SiteArgs,

    /// Maximum restaurants harvested at once (at least 1).
    #[arg(
        long,
        default_value_t = 5,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub concurrency: usize,

    /// Dedup store directory (default: `<data-dir>/dedup`).
    #[arg(long)]
    pub store_dir: Option<String>,

    /// Add this run's rows to an existing city file instead of replacing it.
    #[arg(long)]
    pub append: bool,
}

#[derive(Debug, Args)]
pub struct OverallArgs {
    /// City names.
    #[arg(value_name = "CITY", required = true)]
    pub cities: Vec<String>,

    #[command(flatten)]
    pub site: SiteArgs,
}
