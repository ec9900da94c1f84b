//! Temporal, quality and pin boosts
//!
//! `final = 0.7*base + 0.2*time_boost + 0.1*quality_boost (+0.1 if pinned)`

use std::cmp::Ordering;

use recall_config::constants::{retrieval, scoring};
use recall_core::{keys, RetrievedItem};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Boost parameters
#[derive(Debug, Clone, Copy)]
pub struct BoostConfig {
    pub half_life_days: f64,
    pub quality_step: f32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            half_life_days: retrieval::HALF_LIFE_DAYS,
            quality_step: retrieval::QUALITY_STEP,
        }
    }
}

impl From<&recall_config::RetrievalConfig> for BoostConfig {
    fn from(config: &recall_config::RetrievalConfig) -> Self {
        Self {
            half_life_days: config.half_life_days,
            quality_step: config.quality_step,
        }
    }
}

/// Exponential decay by age, `exp(-ln2 · age / half_life)`
///
/// Untimed items get 1.0. Timestamps in the future count as age 0.
pub fn time_boost(created_at: Option<f64>, now: f64, half_life_days: f64) -> f32 {
    let Some(created_at) = created_at else {
        return 1.0;
    };

    let half_life_secs = half_life_days * SECONDS_PER_DAY;
    if half_life_secs <= 0.0 {
        return 1.0;
    }

    let age = (now - created_at).max(0.0);
    (-std::f64::consts::LN_2 * age / half_life_secs).exp() as f32
}

/// `1 + step · max(0, source_tier)`
pub fn quality_boost(source_tier: f32, step: f32) -> f32 {
    1.0 + step * source_tier.max(0.0)
}

pub fn composite_score(base: f32, time_boost: f32, quality_boost: f32, pinned: bool) -> f32 {
    let pin = if pinned { scoring::PIN_BONUS } else { 0.0 };
    scoring::BASE_WEIGHT * base
        + scoring::TIME_WEIGHT * time_boost
        + scoring::QUALITY_WEIGHT * quality_boost
        + pin
}

/// Score every item and sort best-first
///
/// The incoming `score` is the base. Boost components are recorded in
/// metadata and `score` becomes the composite.
pub fn apply_boosts(
    mut items: Vec<RetrievedItem>,
    now: f64,
    config: BoostConfig,
) -> Vec<RetrievedItem> {
    for item in items.iter_mut() {
        let time = time_boost(item.created_at(), now, config.half_life_days);
        let quality = quality_boost(item.source_tier(), config.quality_step);
        let final_score = composite_score(item.score, time, quality, item.pinned());

        item.set_meta(keys::TIME_BOOST, time);
        item.set_meta(keys::QUALITY_BOOST, quality);
        item.set_meta(keys::FINAL_SCORE, final_score);
        item.score = final_score;
    }

    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    items
}

/// Result of the per-intent type filter
#[derive(Debug, Clone)]
pub struct TypeFilterOutcome {
    pub items: Vec<RetrievedItem>,
    /// An allow-list was configured for the intent
    pub applied: bool,
    /// The allow-list matched nothing and the original ranking was kept
    pub fallback: bool,
}

/// Restrict to an allow-list of metadata `type`s, never narrowing to zero
pub fn apply_type_filter(items: Vec<RetrievedItem>, allow: Option<&[String]>) -> TypeFilterOutcome {
    let Some(allow) = allow else {
        return TypeFilterOutcome {
            items,
            applied: false,
            fallback: false,
        };
    };

    let allowed = |item: &RetrievedItem| {
        item.item_type()
            .map(|t| allow.iter().any(|a| a == t))
            .unwrap_or(false)
    };

    if items.iter().any(allowed) {
        TypeFilterOutcome {
            items: items.into_iter().filter(|i| allowed(i)).collect(),
            applied: true,
            fallback: false,
        }
    } else {
        let fallback = !items.is_empty();
        TypeFilterOutcome {
            items,
            applied: true,
            fallback,
        }
    }
}
