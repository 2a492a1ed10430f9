use crate::settings::ConfidenceWeights;

/// Blends validation, execution, and historical confidence into one 0..=100 score.
/// A missing historical score counts as neutral.
pub fn aggregate(validation: u8, executed: bool, historical: Option<u8>) -> u8 {
    aggregate_weighted(validation, executed, historical, &ConfidenceWeights::default())
}

pub fn aggregate_weighted(
    validation: u8,
    executed: bool,
    historical: Option<u8>,
    weights: &ConfidenceWeights,
) -> u8 {
    let total = weights.validation + weights.execution + weights.historical;
    if total <= 0.0 {
        return 0;
    }
    let execution = if executed { 100.0 } else { 0.0 };
    let historical = f64::from(historical.unwrap_or(weights.neutral_historical).min(100));
    let blended = (weights.validation * f64::from(validation.min(100))
        + weights.execution * execution
        + weights.historical * historical)
        / total;
    blended.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blends_all_three_signals() {
        assert_eq!(aggregate(90, true, Some(80)), 92);
        assert_eq!(aggregate(100, true, Some(100)), 100);
        assert_eq!(aggregate(0, false, Some(0)), 0);
    }

    #[test]
    fn missing_history_is_neutral() {
        assert_eq!(aggregate(100, true, None), 95);
        assert_eq!(aggregate(70, true, None), 83);
    }

    #[test]
    fn failed_execution_caps_confidence() {
        assert_eq!(aggregate(100, false, Some(100)), 60);
    }

    #[test]
    fn custom_weights_are_normalized() {
        let weights = ConfidenceWeights {
            validation: 1.0,
            execution: 1.0,
            historical: 0.0,
            neutral_historical: 75,
        };
        assert_eq!(aggregate_weighted(50, true, Some(0), &weights), 75);
    }
}
