use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::Context as _;
use regex::Regex;
use scraper::{Html, Selector};

use crate::cli::OverallArgs;
use crate::config::{DataLayout, HttpConfig};
use crate::error::HarvestError;
use crate::formats::OverallStatsRecord;
use crate::http::HttpFetcher;
use crate::site::{CityResolver, HttpSite, ListingPageSource, element_text, selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Hotels,
    Forum,
    Restaurants,
    Flights,
    Attractions,
    VacationRentals,
}

/// Where each category's count lives on a city listing page.
const RULES: [(Category, &str); 6] = [
    (Category::Hotels, ".hotels .contentCount"),
    (Category::Forum, ".forum .contentCount"),
    (Category::Restaurants, ".restaurants .contentCount"),
    (Category::Flights, ".flights .contentCount"),
    (Category::Attractions, ".attractions .contentCount"),
    (Category::VacationRentals, ".vacationRentals .contentCount"),
];

static PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^()]*\)").unwrap_or_else(|err| panic!("parenthetical regex: {err}"))
});

pub struct OverallStatsExtractor {
    rules: Vec<(Category, Selector)>,
}

impl OverallStatsExtractor {
    pub fn new() -> anyhow::Result<Self> {
        let rules = RULES
            .iter()
            .map(|(category, raw)| Ok((*category, selector(raw)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Never fails: a category whose count is missing or unparsable is `"0"`.
    pub fn extract(&self, page_html: &str, source_address: &str, city: &str) -> OverallStatsRecord {
        let document = Html::parse_document(page_html);
        let mut record = OverallStatsRecord {
            hotels: "0".to_owned(),
            forum: "0".to_owned(),
            restaurants: "0".to_owned(),
            flights: "0".to_owned(),
            attractions: "0".to_owned(),
            vacation_rentals: "0".to_owned(),
            url: source_address.to_owned(),
            city: city.to_owned(),
        };

        for (category, rule) in &self.rules {
            let Some(count) = document
                .select(rule)
                .next()
                .map(element_text)
                .and_then(|text| leading_count(&text))
            else {
                tracing::debug!(?category, city, "category count missing; using 0");
                continue;
            };
            let slot = match category {
                Category::Hotels => &mut record.hotels,
                Category::Forum => &mut record.forum,
                Category::Restaurants => &mut record.restaurants,
                Category::Flights => &mut record.flights,
                Category::Attractions => &mut record.attractions,
                Category::VacationRentals => &mut record.vacation_rentals,
            };
            *slot = count;
        }

        record
    }
}

/// First whitespace-separated token, if it carries a number.
fn leading_count(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    token
        .chars()
        .any(|ch| ch.is_ascii_digit())
        .then(|| token.to_owned())
}

/// `"1,234 (5%)"` becomes `"1,234"`.
pub fn strip_parenthetical(value: &str) -> String {
    PARENTHETICAL.replace_all(value, "").trim().to_owned()
}

pub fn normalize(record: OverallStatsRecord) -> OverallStatsRecord {
    record.map_values(strip_parenthetical)
}

/// Appends one row to the shared overall file, writing the header first if the file is new.
pub fn append_overall(path: &Path, record: &OverallStatsRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create overall dir: {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open overall file: {}", path.display()))?;
    let needs_header = file
        .metadata()
        .with_context(|| format!("stat overall file: {}", path.display()))?
        .len()
        == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if needs_header {
        writer
            .write_record(OverallStatsRecord::HEADER)
            .context("write overall header")?;
    }
    writer.serialize(record).context("write overall row")?;
    writer.flush().context("flush overall file")?;
    Ok(())
}

pub fn summary(record: &OverallStatsRecord) -> String {
    record
        .fields()
        .iter()
        .map(|(column, value)| format!(" - {column}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `"new york"` becomes `"New York"`.
pub fn display_city(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct OverallPipeline {
    resolver: Arc<dyn CityResolver>,
    pages: Arc<dyn ListingPageSource>,
    extractor: OverallStatsExtractor,
    layout: DataLayout,
}

impl OverallPipeline {
    pub fn new(
        resolver: Arc<dyn CityResolver>,
        pages: Arc<dyn ListingPageSource>,
        layout: DataLayout,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            resolver,
            pages,
            extractor: OverallStatsExtractor::new()?,
            layout,
        })
    }

    pub async fn city_stats(&self, city: &str) -> anyhow::Result<OverallStatsRecord> {
        let city = display_city(city);
        let target = self
            .resolver
            .resolve(&city)
            .await
            .with_context(|| format!("resolve city: {city}"))?;
        let Some(address) = target.listing_address else {
            return Err(HarvestError::CityNotFound { city }.into());
        };

        let html = self
            .pages
            .listing_page(&address)
            .await
            .with_context(|| format!("fetch listing page: {address}"))?;
        let record = normalize(self.extractor.extract(&html, &address, &city));

        let path = self.layout.overall_output();
        append_overall(&path, &record)?;
        tracing::info!(city = %city, file = %path.display(), "stored overall stats");
        Ok(record)
    }

    /// Every city is attempted; the result is an error if any of them failed.
    pub async fn run_batch(&self, cities: &[String]) -> anyhow::Result<()> {
        let mut failed = 0_usize;
        for city in cities {
            match self.city_stats(city).await {
                Ok(record) => println!("{}\n{}", record.city, summary(&record)),
                Err(err) => {
                    tracing::error!(city = %city, err = %format!("{err:#}"), "overall stats failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} cities failed", cities.len());
        }
        Ok(())
    }
}

pub async fn run(args: OverallArgs) -> anyhow::Result<()> {
    let http = HttpConfig::from_env()
        .context("load http config")?
        .with_delay_ms(args.site.delay_ms);
    let fetcher = HttpFetcher::new(http)?;
    let site = Arc::new(HttpSite::new(fetcher, &args.site.base_url)?);
    let layout = DataLayout::new(&args.site.data_dir);

    let pipeline = OverallPipeline::new(site.clone(), site, layout)?;
    pipeline.run_batch(&args.cities).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::formats::CityTarget;

    const LISTING_PAGE: &str = r#"<!doctype html>
<html><body>
  <ul class="nav">
    <li class="hotels"><a href="/Hotels"><span class="contentCount">1,234 (5%)</span></a></li>
    <li class="forum"><span class="contentCount">87 topics</span></li>
    <li class="restaurants"><span class="contentCount">18,062</span></li>
    <li class="flights"><span class="contentCount">n/a</span></li>
    <li class="attractions"><span class="contentCount">3,456</span></li>
  </ul>
  <div class="contentCount">999</div>
</body></html>"#;

    #[test]
    fn missing_and_unparsable_categories_default_to_zero() {
        let extractor = OverallStatsExtractor::new().unwrap();
        let record = extractor.extract(LISTING_PAGE, "https://site.test/Tourism-Paris", "Paris");

        assert_eq!(record.hotels, "1,234");
        assert_eq!(record.forum, "87");
        assert_eq!(record.restaurants, "18,062");
        assert_eq!(record.flights, "0");
        assert_eq!(record.attractions, "3,456");
        assert_eq!(record.vacation_rentals, "0");
        assert_eq!(record.url, "https://site.test/Tourism-Paris");
        assert_eq!(record.city, "Paris");
    }

    #[test]
    fn strips_parenthetical_annotations() {
        assert_eq!(strip_parenthetical("1,234 (5%)"), "1,234");
        assert_eq!(strip_parenthetical("1,234(5%)"), "1,234");
        assert_eq!(strip_parenthetical("(new) 12 (a) (b)"), "12");
        assert_eq!(strip_parenthetical("Paris"), "Paris");
        assert_eq!(strip_parenthetical("open (ended"), "open (ended");
    }

    #[test]
    fn normalize_touches_every_field() {
        let record = OverallStatsRecord {
            hotels: "1 (a)".into(),
            forum: "2(b)".into(),
            restaurants: "3".into(),
            flights: "4 (c)".into(),
            attractions: "5".into(),
            vacation_rentals: "6 (d)".into(),
            url: "https://site.test/x".into(),
            city: "Paris (France)".into(),
        };
        let record = normalize(record);
        assert_eq!(
            [
                record.hotels.as_str(),
                record.forum.as_str(),
                record.flights.as_str(),
                record.vacation_rentals.as_str(),
                record.city.as_str(),
            ],
            ["1", "2", "4", "6", "Paris"]
        );
    }

    #[test]
    fn append_writes_header_once() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("overall").join("overall.csv");
        let extractor = OverallStatsExtractor::new()?;
        let record = normalize(extractor.extract(LISTING_PAGE, "https://site.test/a", "Paris"));

        append_overall(&path, &record)?;
        append_overall(&path, &record)?;

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], OverallStatsRecord::HEADER.join(","));
        assert_eq!(lines[1], r#""1,234",87,"18,062",0,"3,456",0,https://site.test/a,Paris"#);
        Ok(())
    }

    #[test]
    fn summary_lists_every_column() {
        let extractor = OverallStatsExtractor::new().unwrap();
        let record = extractor.extract("<html></html>", "u", "Oslo");
        let text = summary(&record);
        assert!(text.starts_with(" - hotels: 0\n - forum: 0"));
        assert!(text.ends_with(" - URL: u\n - city: Oslo"));
    }

    #[test]
    fn display_city_title_cases_words() {
        assert_eq!(display_city("new  YORK"), "New York");
        assert_eq!(display_city("paris"), "Paris");
    }

    struct FakeSite {
        listings: HashMap<String, String>,
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl CityResolver for FakeSite {
        async fn resolve(&self, city: &str) -> anyhow::Result<CityTarget> {
            Ok(CityTarget {
                name: city.to_owned(),
                listing_address: self.listings.get(city).cloned(),
            })
        }
    }

    #[async_trait]
    impl ListingPageSource for FakeSite {
        async fn listing_page(&self, listing_address: &str) -> anyhow::Result<String> {
            self.pages
                .get(listing_address)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404: {listing_address}"))
        }
    }

    #[tokio::test]
    async fn batch_continues_past_unknown_city() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let site = Arc::new(FakeSite {
            listings: HashMap::from([("Paris".to_owned(), "/Tourism-Paris".to_owned())]),
            pages: HashMap::from([("/Tourism-Paris".to_owned(), LISTING_PAGE.to_owned())]),
        });
        let layout = DataLayout::new(temp.path());
        let pipeline = OverallPipeline::new(site.clone(), site, layout.clone())?;

        let err = pipeline
            .run_batch(&["atlantis".to_owned(), "paris".to_owned()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2 cities failed"));

        let contents = std::fs::read_to_string(layout.overall_output())?;
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("/Tourism-Paris,Paris"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_city_is_classified() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let site = Arc::new(FakeSite {
            listings: HashMap::new(),
            pages: HashMap::new(),
        });
        let pipeline = OverallPipeline::new(site.clone(), site, DataLayout::new(temp.path()))?;

        let err = pipeline.city_stats("atlantis").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::CityNotFound { city }) if city == "Atlantis"
        ));
        Ok(())
    }
}
