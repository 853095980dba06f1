use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityTarget {
    pub name: String,
    pub listing_address: Option<String>,
}

impl CityTarget {
    /// Lowercase, trimmed city name; namespace for dedup marks and on-disk paths.
    pub fn key(&self) -> String {
        city_key(&self.name)
    }
}

pub fn city_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestaurantTarget {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RestaurantIdentity {
    pub name: String,
}

/// A review as the site renders it, before it is attached to a city and restaurant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Review {
    pub title: String,
    pub text: String,
    pub user_id: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub city: String,
    pub restaurant: String,
    pub title: String,
    #[serde(rename = "review_text")]
    pub text: String,
    pub user_id: String,
    pub date: String,
}

impl ReviewRecord {
    pub const HEADER: [&'static str; 6] =
        ["city", "restaurant", "title", "review_text", "user_id", "date"];

    pub fn new(city: &str, restaurant: &str, review: Review) -> Self {
        Self {
            city: city.to_owned(),
            restaurant: restaurant.to_owned(),
            title: review.title,
            text: review.text,
            user_id: review.user_id,
            date: review.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallStatsRecord {
    pub hotels: String,
    pub forum: String,
    pub restaurants: String,
    pub flights: String,
    pub attractions: String,
    #[serde(rename = "vacationRentals")]
    pub vacation_rentals: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub city: String,
}

impl OverallStatsRecord {
    pub const HEADER: [&'static str; 8] = [
        "hotels",
        "forum",
        "restaurants",
        "flights",
        "attractions",
        "vacationRentals",
        "URL",
        "city",
    ];

    /// `(column, value)` pairs in header order.
    pub fn fields(&self) -> [(&'static str, &str); 8] {
        [
            ("hotels", &self.hotels),
            ("forum", &self.forum),
            ("restaurants", &self.restaurants),
            ("flights", &self.flights),
            ("attractions", &self.attractions),
            ("vacationRentals", &self.vacation_rentals),
            ("URL", &self.url),
            ("city", &self.city),
        ]
    }

    pub fn map_values(self, f: impl Fn(&str) -> String) -> Self {
        Self {
            hotels: f(&self.hotels),
            forum: f(&self.forum),
            restaurants: f(&self.restaurants),
            flights: f(&self.flights),
            attractions: f(&self.attractions),
            vacation_rentals: f(&self.vacation_rentals),
            url: f(&self.url),
            city: f(&self.city),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized_header<T: Serialize>(record: &T) -> Vec<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(record).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let header = text.lines().next().unwrap();
        header.split(',').map(str::to_owned).collect()
    }

    #[test]
    fn review_header_matches_serialized_fields() {
        let record = ReviewRecord::new("paris", "Chez Nous", Review::default());
        assert_eq!(serialized_header(&record), ReviewRecord::HEADER);
    }

    #[test]
    fn overall_header_matches_serialized_fields() {
        let record = OverallStatsRecord {
            hotels: "1".into(),
            forum: "2".into(),
            restaurants: "3".into(),
            flights: "4".into(),
            attractions: "5".into(),
            vacation_rentals: "6".into(),
            url: "http://x.test/".into(),
            city: "Paris".into(),
        };
        assert_eq!(serialized_header(&record), OverallStatsRecord::HEADER);
        let columns: Vec<_> = record.fields().iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, OverallStatsRecord::HEADER);
    }

    #[test]
    fn city_key_is_trimmed_lowercase() {
        let city = CityTarget {
            name: " New York ".to_owned(),
            listing_address: None,
        };
        assert_eq!(city.key(), "new york");
    }
}
