//! Subscription filters and client-side matching.

use crate::nip01::Event;
use crate::tag_parsing::has_tag_value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A REQ filter.
///
/// Every present constraint must hold for an event to match. Tag constraints
/// are keyed by `#<name>` on the wire, e.g. `{"#e": ["<event id>"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event id prefixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Author public key prefixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Relay-side result cap; never affects matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(Vec::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(Vec::new)
            .push(author.into());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(Vec::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(Vec::new).extend(kinds);
        self
    }

    /// Require a `name` tag whose value is one of `values`.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{name}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|prefix| event.id.starts_with(prefix.as_str()))
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors
                .iter()
                .any(|prefix| event.pubkey.starts_with(prefix.as_str()))
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        for (key, values) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            if !has_tag_value(&event.tags, name, values) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

/// True when any filter matches.
pub fn match_filters(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}
