//! Paged rule search.
//!
//! Filters run in a fixed order: structural matches first, then
//! substring/prefix matches, then caller predicates. Results are sorted
//! with the rule id as tie-breaker and cut to one page.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use mesh_core::model::Rule;
use mesh_core::{CacheError, CacheResult, Record};

/// Default page size.
pub const DEFAULT_LIMIT: usize = 100;

/// Field to sort search results by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderField {
    /// Modification time.
    #[default]
    ModifyTime,
    /// Evaluation priority.
    Priority,
    /// Rule name.
    Name,
}

impl FromStr for OrderField {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mtime" | "modify_time" => Ok(Self::ModifyTime),
            "priority" => Ok(Self::Priority),
            "name" => Ok(Self::Name),
            other => Err(CacheError::invalid_query(format!("unknown order field {other:?}"))),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Smallest first.
    Asc,
    /// Largest first.
    #[default]
    Desc,
}

impl FromStr for OrderDirection {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(CacheError::invalid_query(format!("unknown order type {other:?}"))),
        }
    }
}

/// Caller-supplied filter applied after the built-in ones.
pub type Predicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// One page of search results.
#[derive(Debug, Clone)]
pub struct Page<R> {
    /// Matches before pagination.
    pub total: usize,
    /// Matches on this page.
    pub items: Vec<Arc<R>>,
}

/// Search arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQuery {
    /// Exact rule id.
    pub id: Option<String>,
    /// Rule name; a trailing `*` makes it a prefix match.
    pub name: Option<String>,
    /// Exact namespace the rule was created in.
    pub namespace: Option<String>,
    /// Name of a service the rule mentions.
    pub service: Option<String>,
    /// Namespace of a service the rule mentions.
    pub service_namespace: Option<String>,
    /// Substring of the description.
    pub description: Option<String>,
    /// Enabled state.
    pub enable: Option<bool>,
    /// Sort field.
    pub order_field: OrderField,
    /// Sort direction.
    pub order_direction: OrderDirection,
    /// Matches to skip.
    pub offset: usize,
    /// Page size.
    pub limit: usize,
}

impl Default for RuleQuery {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            namespace: None,
            service: None,
            service_namespace: None,
            description: None,
            enable: None,
            order_field: OrderField::default(),
            order_direction: OrderDirection::default(),
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

fn parse_number(key: &str, value: &str) -> CacheResult<usize> {
    value
        .parse()
        .map_err(|_| CacheError::invalid_query(format!("{key} must be a non-negative integer, got {value:?}")))
}

impl RuleQuery {
    /// Build a query from string parameters, as received over an admin API.
    ///
    /// Unknown keys are ignored; malformed values are rejected.
    pub fn from_params(params: &HashMap<String, String>) -> CacheResult<Self> {
        let mut query = Self::default();
        for (key, value) in params {
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "id" => query.id = Some(value.clone()),
                "name" => query.name = Some(value.clone()),
                "namespace" => query.namespace = Some(value.clone()),
                "service" => query.service = Some(value.clone()),
                "service_namespace" => query.service_namespace = Some(value.clone()),
                "description" => query.description = Some(value.clone()),
                "enable" => {
                    query.enable = Some(value.parse().map_err(|_| {
                        CacheError::invalid_query(format!("enable must be true or false, got {value:?}"))
                    })?)
                }
                "offset" => query.offset = parse_number(key, value)?,
                "limit" => query.limit = parse_number(key, value)?,
                "order_field" => query.order_field = value.parse()?,
                "order_type" => query.order_direction = value.parse()?,
                _ => {}
            }
        }
        Ok(query)
    }

    fn matches_structural<R: Rule>(&self, rule: &R) -> bool {
        if self.id.as_deref().is_some_and(|id| id != rule.id()) {
            return false;
        }
        if self
            .namespace
            .as_deref()
            .is_some_and(|ns| ns != rule.meta().namespace)
        {
            return false;
        }
        if let Some(enable) = self.enable {
            if enable != rule.enabled() {
                return false;
            }
        }
        if self.service.is_some() || self.service_namespace.is_some() {
            let hit = rule.related_services().iter().any(|svc| {
                self.service.as_deref().map_or(true, |n| n == svc.name)
                    && self
                        .service_namespace
                        .as_deref()
                        .map_or(true, |ns| ns == svc.namespace)
            });
            if !hit {
                return false;
            }
        }
        true
    }

    fn matches_text<R: Rule>(&self, rule: &R) -> bool {
        if let Some(name) = &self.name {
            let ok = match name.strip_suffix('*') {
                Some(prefix) => rule.name().starts_with(prefix),
                None => rule.name() == name,
            };
            if !ok {
                return false;
            }
        }
        if let Some(desc) = &self.description {
            if !rule.meta().description.contains(desc.as_str()) {
                return false;
            }
        }
        true
    }

    fn compare<R: Rule>(&self, a: &R, b: &R) -> Ordering {
        let primary = match self.order_field {
            OrderField::ModifyTime => a.modify_time().cmp(&b.modify_time()),
            OrderField::Priority => a.priority().cmp(&b.priority()),
            OrderField::Name => a.name().cmp(b.name()),
        };
        let primary = match self.order_direction {
            OrderDirection::Asc => primary,
            OrderDirection::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id().cmp(b.id()))
    }

    /// Filter, sort, and page `rules`.
    pub fn run<R: Rule>(
        &self,
        rules: impl IntoIterator<Item = Arc<R>>,
        predicates: &[Predicate<R>],
    ) -> Page<R> {
        let mut matched: Vec<Arc<R>> = rules
            .into_iter()
            .filter(|r| self.matches_structural(r.as_ref()))
            .filter(|r| self.matches_text(r.as_ref()))
            .filter(|r| predicates.iter().all(|p| p(r.as_ref())))
            .collect();
        let total = matched.len();
        if self.limit == 0 || self.offset >= total {
            return Page {
                total,
                items: Vec::new(),
            };
        }
        matched.sort_by(|a, b| self.compare(a.as_ref(), b.as_ref()));
        let items = matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect();
        Page { total, items }
    }
}
