//! Data-quality scoring for parsed elevations.
//!
//! The score is an integer in `0..=100`, monotone in the presence of each
//! input:
//!
//! | Component | Points |
//! |-----------|--------|
//! | name, width, height | 20, pro rata |
//! | description, short description, depth, system code, system name, category | 40, pro rata |
//! | at least one glass specification | 20 |
//! | no validation warnings, with a width or height present | 10 |
//! | name present and at least one glass specification, all identified | 10 |
//!
//! A record carrying nothing but its name scores 7.

use crate::models::{GlassSpecification, ParsedElevation};

const BASE_POINTS: u32 = 20;
const ENRICHED_POINTS: u32 = 40;
const GLASS_POINTS: u32 = 20;
const CLEAN_POINTS: u32 = 10;
const IDENTIFIED_POINTS: u32 = 10;

pub fn quality_score(
    parsed: &ParsedElevation,
    glass: &[GlassSpecification],
    warnings: &[String],
) -> u8 {
    let base = [
        parsed.name.is_some(),
        parsed.width.is_some(),
        parsed.height.is_some(),
    ];
    let enriched = [
        parsed.description.is_some(),
        parsed.short_description.is_some(),
        parsed.depth.is_some(),
        parsed.system_code.is_some(),
        parsed.system_name.is_some(),
        parsed.category.is_some(),
    ];

    let mut score = pro_rata(BASE_POINTS, &base) + pro_rata(ENRICHED_POINTS, &enriched);
    if !glass.is_empty() {
        score += GLASS_POINTS;
    }
    let measured = parsed.width.is_some() || parsed.height.is_some();
    if warnings.is_empty() && measured {
        score += CLEAN_POINTS;
    }
    let identified = !glass.is_empty() && glass.iter().all(|g| g.glass_id.is_some());
    if parsed.name.is_some() && identified {
        score += IDENTIFIED_POINTS;
    }
    score.min(100) as u8
}

/// `points * present / total`, rounded half up.
fn pro_rata(points: u32, present: &[bool]) -> u32 {
    let total = present.len() as u32;
    if total == 0 {
        return 0;
    }
    let hits = present.iter().filter(|p| **p).count() as u32;
    (points * hits * 2 + total) / (total * 2)
}
