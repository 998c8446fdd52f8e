use url::Url;

use crate::model::Record;

/// Empty lists and empty strings match everything. Values inside one
/// criterion are OR'd; criteria are AND'd together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub states: Vec<String>,
    pub tracker_domains: Vec<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub search_text: String,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
            && self.tracker_domains.is_empty()
            && self.category.is_empty()
            && self.tags.is_empty()
            && self.search_text.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.matches_state(record)
            && self.matches_tracker(record)
            && self.matches_category(record)
            && self.matches_tags(record)
            && self.matches_search(record)
    }

    fn matches_state(&self, record: &Record) -> bool {
        self.states.is_empty() || self.states.iter().any(|state| *state == record.state)
    }

    fn matches_tracker(&self, record: &Record) -> bool {
        if self.tracker_domains.is_empty() {
            return true;
        }
        let domain = tracker_domain(&record.tracker);
        !domain.is_empty()
            && self
                .tracker_domains
                .iter()
                .any(|d| d.trim().eq_ignore_ascii_case(&domain))
    }

    fn matches_category(&self, record: &Record) -> bool {
        self.category.is_empty() || self.category == record.category
    }

    fn matches_tags(&self, record: &Record) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        split_tags(&record.tags).any(|tag| self.tags.iter().any(|wanted| wanted == tag))
    }

    fn matches_search(&self, record: &Record) -> bool {
        if self.search_text.is_empty() {
            return true;
        }
        record
            .name
            .to_lowercase()
            .contains(&self.search_text.to_lowercase())
    }
}

pub fn apply<'a, I>(records: I, criteria: &FilterCriteria) -> Vec<&'a Record>
where
    I: IntoIterator<Item = &'a Record>,
{
    records
        .into_iter()
        .filter(|record| criteria.matches(record))
        .collect()
}

/// Host component of a tracker URL; empty when the URL does not parse.
pub fn tracker_domain(tracker: &str) -> String {
    Url::parse(tracker.trim())
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn split_tags(tags: &str) -> impl Iterator<Item = &str> {
    tags.split(',').map(str::trim).filter(|tag| !tag.is_empty())
}
