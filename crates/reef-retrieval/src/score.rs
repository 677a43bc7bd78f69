use reef_core::types::DistanceMetric;
use tracing::warn;

/// Convert a backend distance to a similarity score in [0, 1].
///
/// Cosine and inner-product distances range over [0, 2] for unit vectors
/// (`d = 1 − similarity`), so `score = max(0, 1 − d)`. L2 distances are
/// squared; for unit vectors `L2² = 2 · cosine distance`, so
/// `score = max(0, 1 − d/2)`.
pub fn score_from_distance(distance: f64, metric: DistanceMetric) -> f64 {
    if !distance.is_finite() {
        warn!(distance, "non-finite distance; scoring as 0");
        return 0.0;
    }
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Ip => (1.0 - distance).max(0.0),
        DistanceMetric::L2 => (1.0 - distance / 2.0).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_endpoints() {
        assert_eq!(score_from_distance(0.0, DistanceMetric::Cosine), 1.0);
        assert_eq!(score_from_distance(1.0, DistanceMetric::Cosine), 0.0);
        assert_eq!(score_from_distance(2.0, DistanceMetric::Cosine), 0.0);
        assert_eq!(score_from_distance(0.5, DistanceMetric::Cosine), 0.5);
    }

    #[test]
    fn l2_endpoints() {
        assert_eq!(score_from_distance(0.0, DistanceMetric::L2), 1.0);
        assert_eq!(score_from_distance(2.0, DistanceMetric::L2), 0.0);
        assert_eq!(score_from_distance(1.0, DistanceMetric::L2), 0.5);
        assert_eq!(score_from_distance(4.0, DistanceMetric::L2), 0.0);
    }

    #[test]
    fn ip_matches_cosine() {
        for d in [0.0, 0.3, 1.0, 2.0] {
            assert_eq!(
                score_from_distance(d, DistanceMetric::Ip),
                score_from_distance(d, DistanceMetric::Cosine)
            );
        }
    }
}
