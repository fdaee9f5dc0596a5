use crate::period::{Period, PeriodType};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub const DEFAULT_NAMESPACE: &str = "default";
const DIRTY_SUFFIX: &str = "_dirty";

/// Which key layout a counter is addressed with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyShape {
    /// `namespace:period_type:bucket:name`
    #[default]
    Scoped,
    /// `namespace:name`, no bucketing at all
    Simple,
}

/// Identity of a single counter instance.
///
/// The partial key addresses the counter inside a namespace-isolated cache, the full key
/// addresses it in the durable store which has no namespaces of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    namespace: String,
    name: String,
    scope: Option<(PeriodType, String)>,
}

impl CounterKey {
    pub fn scoped(namespace: &str, period_type: PeriodType, period: &Period, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            scope: Some((period_type, period_type.scope(period))),
        }
    }

    pub fn simple(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            scope: None,
        }
    }

    /// Rebuild a key from an already computed bucket, as stored in a durable record.
    pub fn from_bucket(
        namespace: &str,
        name: &str,
        scope: Option<(PeriodType, &str)>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            scope: scope.map(|(ty, bucket)| (ty, bucket.to_string())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period_type(&self) -> Option<PeriodType> {
        self.scope.as_ref().map(|(ty, _)| *ty)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.scope.as_ref().map(|(_, bucket)| bucket.as_str())
    }

    pub fn shape(&self) -> KeyShape {
        match self.scope {
            Some(_) => KeyShape::Scoped,
            None => KeyShape::Simple,
        }
    }

    pub fn partial(&self) -> String {
        match &self.scope {
            Some((ty, bucket)) => format!("{ty}:{bucket}:{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn full(&self) -> String {
        format!("{}:{}", self.namespace, self.partial())
    }

    /// Cache key whose presence means a flush for this counter is pending.
    pub fn dirty(&self) -> String {
        format!("{}{DIRTY_SUFFIX}", self.partial())
    }
}

impl Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full())
    }
}

pub fn partial_key(period_type: PeriodType, period: &Period, name: &str) -> String {
    format!("{period_type}:{}:{name}", period_type.scope(period))
}

pub fn full_key(namespace: &str, period_type: PeriodType, period: &Period, name: &str) -> String {
    format!("{namespace}:{}", partial_key(period_type, period, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let period: Period = "2011-06-13 18:11:32".parse().unwrap();
        let key = CounterKey::scoped("tweet", PeriodType::Day, &period, "visits");
        assert_eq!(key.partial(), "day:2011-06-13:visits");
        assert_eq!(key.full(), "tweet:day:2011-06-13:visits");
        assert_eq!(key.dirty(), "day:2011-06-13:visits_dirty");
        assert_eq!(key.partial(), partial_key(PeriodType::Day, &period, "visits"));
        assert_eq!(key.full(), full_key("tweet", PeriodType::Day, &period, "visits"));

        let key = CounterKey::scoped(DEFAULT_NAMESPACE, PeriodType::All, &period, "visits");
        assert_eq!(key.full(), "default:all:all:visits");
    }

    #[test]
    fn test_simple_layout() {
        let key = CounterKey::simple("site", "visits");
        assert_eq!(key.partial(), "visits");
        assert_eq!(key.full(), "site:visits");
        assert_eq!(key.shape(), KeyShape::Simple);
        assert_eq!(key.period_type(), None);
    }

    #[test]
    fn test_empty_name_is_well_formed() {
        let period: Period = "2011-06-13".parse().unwrap();
        let key = CounterKey::scoped("ns", PeriodType::Year, &period, "");
        assert_eq!(key.full(), "ns:year:2011:");
    }

    #[test]
    fn test_rebuild_from_bucket() {
        let period: Period = "2011-06-15 01:02:03".parse().unwrap();
        let key = CounterKey::scoped("ns", PeriodType::Week, &period, "hits");
        let rebuilt = CounterKey::from_bucket(
            key.namespace(),
            key.name(),
            key.period_type().zip(key.bucket()),
        );
        assert_eq!(rebuilt, key);
    }
}
