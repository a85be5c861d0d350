//! Sample-to-connector routing.

use crate::sample::CloudSample;
use fieldgate_core::Quality;
use std::fmt;
use std::sync::Arc;

/// Decides whether a rule applies to a sample.
#[derive(Clone)]
pub enum SampleMatcher {
    /// Matches everything.
    Any,
    /// Exact device id.
    Device(String),
    /// Device id prefix (site/line groupings).
    DevicePrefix(String),
    /// One specific tag.
    Tag { device_id: String, tag_id: String },
    /// Samples of one quality.
    QualityIs(Quality),
    /// Arbitrary predicate.
    Predicate(Arc<dyn Fn(&CloudSample) -> bool + Send + Sync>),
}

impl SampleMatcher {
    pub fn matches(&self, sample: &CloudSample) -> bool {
        match self {
            SampleMatcher::Any => true,
            SampleMatcher::Device(device_id) => sample.device_id == *device_id,
            SampleMatcher::DevicePrefix(prefix) => sample.device_id.starts_with(prefix),
            SampleMatcher::Tag { device_id, tag_id } => {
                sample.device_id == *device_id && sample.tag_id == *tag_id
            }
            SampleMatcher::QualityIs(quality) => sample.quality == *quality,
            SampleMatcher::Predicate(predicate) => predicate(sample),
        }
    }
}

impl fmt::Debug for SampleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMatcher::Any => write!(f, "Any"),
            SampleMatcher::Device(d) => write!(f, "Device({d:?})"),
            SampleMatcher::DevicePrefix(p) => write!(f, "DevicePrefix({p:?})"),
            SampleMatcher::Tag { device_id, tag_id } => {
                write!(f, "Tag({device_id:?}/{tag_id:?})")
            }
            SampleMatcher::QualityIs(q) => write!(f, "QualityIs({q})"),
            SampleMatcher::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Routes matching samples to one connector.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub matcher: SampleMatcher,
    pub connector: String,
    /// `false`: a match stops evaluation (exclusive delivery).
    /// `true`: a match adds this connector and evaluation continues.
    pub fan_out: bool,
}

impl RoutingRule {
    pub fn exclusive(matcher: SampleMatcher, connector: impl Into<String>) -> Self {
        Self {
            matcher,
            connector: connector.into(),
            fan_out: false,
        }
    }

    pub fn fan_out(matcher: SampleMatcher, connector: impl Into<String>) -> Self {
        Self {
            matcher,
            connector: connector.into(),
            fan_out: true,
        }
    }
}

/// Ordered rules plus the default connector for unmatched samples.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default_connector: Option<String>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>, default_connector: Option<String>) -> Self {
        Self {
            rules,
            default_connector,
        }
    }

    /// Connectors a sample should reach, in rule order, deduplicated.
    pub fn route(&self, sample: &CloudSample) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if !rule.matcher.matches(sample) {
                continue;
            }
            if !targets.contains(&rule.connector.as_str()) {
                targets.push(&rule.connector);
            }
            if !rule.fan_out {
                return targets;
            }
        }
        if targets.is_empty() {
            if let Some(default) = &self.default_connector {
                targets.push(default);
            }
        }
        targets
    }
}
