//! Source ranking: a pure score over a record's quality attributes that
//! orders fallback candidates, highest first. Scores are additive across
//! matching rules and a geo-blocked source is penalized below any clear one
//! of lower quality.

use regex::Regex;

use super::ChannelRecord;

const GEO_BLOCK_PENALTY: i32 = -5;

pub struct RankingRules {
    rules: Vec<(Regex, i32)>,
}

impl RankingRules {
    pub fn new() -> Self {
        // Substring match, so compound labels like "1080i" or "4k60" still
        // score. The "hd" marker must not fire inside "uhd".
        let table = [
            (r"(?i)4k|uhd", 5),
            (r"(?i)fhd|1080|(^|[^u])hd", 3),
            (r"(?i)sd|720|576", 2),
            (r"(?i)480|360", 1),
        ];
        let rules = table
            .iter()
            .map(|(pattern, points)| {
                let regex = Regex::new(pattern).expect("built-in ranking pattern is valid");
                (regex, *points)
            })
            .collect();
        Self { rules }
    }

    /// Sum of all rules matching either the declared quality label or any
    /// free-form extra attribute, plus the geo-block penalty. Absent
    /// attributes contribute nothing.
    pub fn score(&self, record: &ChannelRecord) -> i32 {
        let mut total = 0;
        for (regex, points) in &self.rules {
            let quality_hit = record
                .quality
                .as_deref()
                .map(|label| regex.is_match(label))
                .unwrap_or(false);
            let extras_hit = record.extras.values().any(|value| regex.is_match(value));
            if quality_hit || extras_hit {
                total += points;
            }
        }
        if record.geo_blocked {
            total += GEO_BLOCK_PENALTY;
        }
        total
    }
}

impl Default for RankingRules {
    fn default() -> Self {
        Self::new()
    }
}

/// Order candidates by precomputed score, highest first. The sort is stable
/// so catalog order breaks ties.
pub fn rank(records: Vec<ChannelRecord>) -> Vec<ChannelRecord> {
    let mut ranked = records;
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(quality: &str) -> ChannelRecord {
        let mut record =
            ChannelRecord::new("id", "Demo", "http://example/stream").with_quality(quality);
        record.rescore(&RankingRules::new());
        record
    }

    #[test]
    fn quality_tiers_are_monotonic() {
        let uhd = record("4K UHD");
        let hd = record("HD");
        let sd = record("SD");
        let low = record("360p");
        assert!(uhd.score > hd.score);
        assert!(hd.score > sd.score);
        assert!(sd.score > low.score);
    }

    #[test]
    fn uhd_label_does_not_double_count_hd() {
        assert_eq!(record("UHD").score, 5);
        assert_eq!(record("FHD").score, 3);
    }

    #[test]
    fn compound_labels_score_their_tier() {
        assert_eq!(record("1080i").score, 3);
        assert_eq!(record("4k60").score, 5);
        assert_eq!(record("720p50").score, 2);
    }

    #[test]
    fn geo_block_outweighs_quality() {
        let rules = RankingRules::new();
        let mut blocked_uhd = ChannelRecord::new("a", "Demo", "http://a")
            .with_quality("4K")
            .geo_blocked(true);
        blocked_uhd.rescore(&rules);
        let mut clear_hd = ChannelRecord::new("b", "Demo", "http://b").with_quality("HD");
        clear_hd.rescore(&rules);
        assert_eq!(blocked_uhd.score, 0);
        assert_eq!(clear_hd.score, 3);

        let ranked = rank(vec![blocked_uhd, clear_hd]);
        assert_eq!(ranked[0].id, "b");
    }

    #[test]
    fn extras_attributes_are_matched() {
        let rules = RankingRules::new();
        let mut record = ChannelRecord::new("a", "Demo", "http://a")
            .with_extra("tvg-resolution", "1080p");
        record.rescore(&rules);
        assert_eq!(record.score, 3);
    }

    #[test]
    fn missing_attributes_score_zero() {
        let rules = RankingRules::new();
        let mut record = ChannelRecord::new("a", "Demo", "http://a");
        record.rescore(&rules);
        assert_eq!(record.score, 0);
    }

    #[test]
    fn ties_keep_catalog_order() {
        let rules = RankingRules::new();
        let mut first = ChannelRecord::new("first", "Demo", "http://1").with_quality("HD");
        let mut second = ChannelRecord::new("second", "Demo", "http://2").with_quality("1080");
        first.rescore(&rules);
        second.rescore(&rules);
        assert_eq!(first.score, second.score);
        let ranked = rank(vec![first, second]);
        assert_eq!(ranked[0].id, "first");
        assert_eq!(ranked[1].id, "second");
    }
}
