//! The review site as the harvester sees it: city lookup, restaurant catalog, restaurant
//! pages and the city listing page.
//!
//! The traits are the seams the pipelines depend on; [`HttpSite`] implements all of them
//! over plain HTML pages using the CSS selectors in [`SiteSelectors`].

use std::collections::HashSet;

use anyhow::Context as _;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::formats::{CityTarget, RestaurantIdentity, RestaurantTarget, Review};
use crate::http::HttpFetcher;

/// Default upper bound on pages followed through `next` links for one listing or restaurant.
pub const DEFAULT_MAX_PAGES: usize = 500;

#[async_trait]
pub trait CityResolver: Send + Sync {
    /// An unknown city is `Ok` with no listing address, not an error.
    async fn resolve(&self, city: &str) -> anyhow::Result<CityTarget>;
}

#[async_trait]
pub trait RestaurantCatalog: Send + Sync {
    /// Every restaurant page address for the city, in listing order, across all pages.
    async fn restaurants(&self, listing_address: &str) -> anyhow::Result<Vec<RestaurantTarget>>;
}

/// A restaurant after its page was looked up once.
#[derive(Debug, Clone)]
pub struct IdentifiedRestaurant {
    pub target: RestaurantTarget,
    pub identity: RestaurantIdentity,
    /// The first review page as fetched while identifying, reused by `reviews`.
    pub first_page: Option<String>,
}

#[async_trait]
pub trait RestaurantHarvester: Send + Sync {
    async fn identify(&self, target: &RestaurantTarget) -> anyhow::Result<IdentifiedRestaurant>;

    /// Every review for the restaurant, across all review pages. Hitting the page limit
    /// is an error, never a shortened list.
    async fn reviews(&self, restaurant: &IdentifiedRestaurant) -> anyhow::Result<Vec<Review>>;
}

#[async_trait]
pub trait ListingPageSource: Send + Sync {
    async fn listing_page(&self, listing_address: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct SiteSelectors {
    pub search_result: Selector,
    pub restaurants_link: Selector,
    pub restaurant_link: Selector,
    pub next_page: Selector,
    pub restaurant_name: Selector,
    pub review: Selector,
    pub review_title: Selector,
    pub review_text: Selector,
    pub review_user: Selector,
    pub review_date: Selector,
}

impl SiteSelectors {
    pub fn tripadvisor() -> anyhow::Result<Self> {
        Ok(Self {
            search_result: selector(r#"a[href*="/Tourism-"]"#)?,
            restaurants_link: selector(r#"a[href*="/Restaurants-"]"#)?,
            restaurant_link: selector(r#"a[href*="/Restaurant_Review-"]"#)?,
            next_page: selector("a.nav.next[href]")?,
            restaurant_name: selector("h1")?,
            review: selector(".review-container")?,
            review_title: selector(".noQuotes, .quote")?,
            review_text: selector(".partial_entry")?,
            review_user: selector(".memberOverlayLink, .info_text")?,
            review_date: selector(".ratingDate")?,
        })
    }
}

pub fn selector(raw: &str) -> anyhow::Result<Selector> {
    Selector::parse(raw).map_err(|err| anyhow::anyhow!("invalid css selector {raw:?}: {err}"))
}

pub struct HttpSite {
    fetcher: HttpFetcher,
    base_url: Url,
    selectors: SiteSelectors,
    max_pages: usize,
}

impl HttpSite {
    pub fn new(fetcher: HttpFetcher, base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("parse --base-url")?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            anyhow::bail!("--base-url must be http/https: {base_url}");
        }
        Ok(Self {
            fetcher,
            base_url,
            selectors: SiteSelectors::tripadvisor()?,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn absolute(&self, address: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(address)
            .with_context(|| format!("resolve address: {address}"))
    }
}

#[async_trait]
impl CityResolver for HttpSite {
    async fn resolve(&self, city: &str) -> anyhow::Result<CityTarget> {
        let mut search_url = self.absolute("/Search")?;
        search_url.query_pairs_mut().append_pair("q", city);

        let html = self.fetcher.get_html(&search_url).await?;
        let listing = first_link(&html, &self.selectors.search_result, &search_url);
        tracing::debug!(city, listing = ?listing.as_ref().map(Url::as_str), "resolved city");

        Ok(CityTarget {
            name: city.to_owned(),
            listing_address: listing.map(String::from),
        })
    }
}

#[async_trait]
impl ListingPageSource for HttpSite {
    async fn listing_page(&self, listing_address: &str) -> anyhow::Result<String> {
        let url = self.absolute(listing_address)?;
        self.fetcher.get_html(&url).await
    }
}

#[async_trait]
impl RestaurantCatalog for HttpSite {
    async fn restaurants(&self, listing_address: &str) -> anyhow::Result<Vec<RestaurantTarget>> {
        let listing_url = self.absolute(listing_address)?;
        let listing_html = self.fetcher.get_html(&listing_url).await?;
        let mut page_url = first_link(&listing_html, &self.selectors.restaurants_link, &listing_url)
            .ok_or_else(|| anyhow::anyhow!("no restaurants link on listing page: {listing_url}"))?;

        let mut seen_pages = HashSet::new();
        let mut seen_restaurants = HashSet::new();
        let mut targets = Vec::new();

        while seen_pages.insert(page_url.clone()) {
            if seen_pages.len() > self.max_pages {
                tracing::warn!(
                    listing = %listing_url,
                    max_pages = self.max_pages,
                    listed = targets.len(),
                    "restaurant listing page limit reached; later pages are not listed"
                );
                break;
            }
            let html = self.fetcher.get_html(&page_url).await?;
            let (links, next) = {
                let document = Html::parse_document(&html);
                let links = links(&document, &self.selectors.restaurant_link, &page_url);
                let next = next_link(&document, &self.selectors.next_page, &page_url);
                (links, next)
            };

            for link in links {
                if seen_restaurants.insert(link.clone()) {
                    targets.push(RestaurantTarget {
                        address: link.into(),
                    });
                }
            }
            tracing::debug!(page = %page_url, total = targets.len(), "read restaurant listing page");

            match next {
                Some(next) => page_url = next,
                None => break,
            }
        }

        Ok(targets)
    }
}

#[async_trait]
impl RestaurantHarvester for HttpSite {
    async fn identify(&self, target: &RestaurantTarget) -> anyhow::Result<IdentifiedRestaurant> {
        let url = self.absolute(&target.address)?;
        let html = self.fetcher.get_html(&url).await?;
        let name = Html::parse_document(&html)
            .select(&self.selectors.restaurant_name)
            .map(element_text)
            .find(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("restaurant page has no name: {url}"))?;
        Ok(IdentifiedRestaurant {
            target: target.clone(),
            identity: RestaurantIdentity { name },
            first_page: Some(html),
        })
    }

    async fn reviews(&self, restaurant: &IdentifiedRestaurant) -> anyhow::Result<Vec<Review>> {
        let mut page_url = self.absolute(&restaurant.target.address)?;
        let mut prefetched = restaurant.first_page.clone();
        let mut seen_pages = HashSet::new();
        let mut reviews = Vec::new();

        while seen_pages.insert(page_url.clone()) {
            if seen_pages.len() > self.max_pages {
                anyhow::bail!(
                    "restaurant has more than {} review pages: {}",
                    self.max_pages,
                    restaurant.target.address
                );
            }
            let html = match prefetched.take() {
                Some(html) => html,
                None => self.fetcher.get_html(&page_url).await?,
            };
            let (page_reviews, next) = {
                let document = Html::parse_document(&html);
                let page_reviews = parse_reviews(&document, &self.selectors);
                let next = next_link(&document, &self.selectors.next_page, &page_url);
                (page_reviews, next)
            };
            reviews.extend(page_reviews);

            match next {
                Some(next) => page_url = next,
                None => break,
            }
        }

        Ok(reviews)
    }
}

fn parse_reviews(document: &Html, selectors: &SiteSelectors) -> Vec<Review> {
    document
        .select(&selectors.review)
        .map(|container| Review {
            title: first_text(container, &selectors.review_title),
            text: first_text(container, &selectors.review_text),
            user_id: container
                .select(&selectors.review_user)
                .next()
                .map(|el| match el.value().attr("id") {
                    Some(id) => id.trim().to_owned(),
                    None => element_text(el),
                })
                .unwrap_or_default(),
            date: container
                .select(&selectors.review_date)
                .next()
                .map(|el| match el.value().attr("title") {
                    Some(title) => title.trim().to_owned(),
                    None => element_text(el),
                })
                .unwrap_or_default(),
        })
        .collect()
}

fn first_link(html: &str, selector: &Selector, page_url: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    links(&document, selector, page_url).into_iter().next()
}

fn links(document: &Html, selector: &Selector, page_url: &Url) -> Vec<Url> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| page_url.join(href).ok())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}

fn next_link(document: &Html, selector: &Selector, page_url: &Url) -> Option<Url> {
    links(document, selector, page_url)
        .into_iter()
        .find(|url| url != page_url)
}

fn first_text(container: ElementRef<'_>, selector: &Selector) -> String {
    container
        .select(selector)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

/// Text content with runs of whitespace collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
