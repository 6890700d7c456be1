use std::collections::HashMap;

use statrs::distribution::{ContinuousCDF, Normal};
use uuid::Uuid;

use crate::error::AnalysisError;
use crate::models::SimilarityFact;

/// Map each submission to the list of similarity percentages it participates
/// in, counting each unordered pair exactly once.
///
/// Only rows already in canonical form (`submission_id_1 < submission_id_2`)
/// are traversed, so a relation that happens to contain both directions of a
/// pair still credits it once to each participant. An assignment with no facts
/// yields an empty map; callers decide what emptiness means.
pub fn scores_by_submission(facts: &[SimilarityFact]) -> HashMap<Uuid, Vec<f64>> {
    let mut scores: HashMap<Uuid, Vec<f64>> = HashMap::new();

    for fact in facts {
        if fact.submission_id_1 >= fact.submission_id_2 {
            continue;
        }
        scores
            .entry(fact.submission_id_1)
            .or_default()
            .push(fact.percentage);
        scores
            .entry(fact.submission_id_2)
            .or_default()
            .push(fact.percentage);
    }

    scores
}

/// Population mean and standard deviation over all scores from all students.
///
/// The flattened scores are the entire finite population (every submission
/// pair was measured), so the variance divides by N with no Bessel
/// correction. The finite-population correction in [`student_z_score`] relies
/// on the same framing.
pub fn population_stats(
    scores_by_student: &HashMap<Uuid, Vec<f64>>,
) -> Result<(f64, f64), AnalysisError> {
    let mut total = 0.0;
    let mut count = 0usize;
    for scores in scores_by_student.values() {
        for score in scores {
            total += score;
            count += 1;
        }
    }

    if count == 0 {
        return Err(AnalysisError::EmptyPopulation);
    }

    let mu = total / count as f64;
    let mut sum_squared_diff = 0.0;
    for scores in scores_by_student.values() {
        for score in scores {
            let deviation = score - mu;
            sum_squared_diff += deviation * deviation;
        }
    }
    let sigma = (sum_squared_diff / count as f64).sqrt();

    Ok((mu, sigma))
}

/// Standard error of a sample mean against the population sigma, with the
/// finite-population correction `sqrt((N - n) / (N - 1))` applied when
/// `fpc_population` is given.
fn standard_error(
    n: usize,
    sigma: f64,
    fpc_population: Option<usize>,
) -> Result<f64, AnalysisError> {
    if n == 0 {
        return Err(AnalysisError::InvalidSampleSize { n, population: 0 });
    }

    let mut se = sigma / (n as f64).sqrt();
    if let Some(population) = fpc_population {
        if population <= n {
            return Err(AnalysisError::InvalidSampleSize { n, population });
        }
        let fpc = ((population - n) as f64 / (population - 1) as f64).sqrt();
        se *= fpc;
    }

    Ok(se)
}

/// Sample mean and z-score of that mean against the population.
pub fn student_z_score(
    scores: &[f64],
    mu: f64,
    sigma: f64,
    fpc_population: Option<usize>,
) -> Result<(f64, f64), AnalysisError> {
    let n = scores.len();
    let se = standard_error(n, sigma, fpc_population)?;
    let mean = scores.iter().sum::<f64>() / n as f64;
    let z = (mean - mu) / se;
    Ok((mean, z))
}

/// Two-sided normal-approximation confidence interval for a student's mean
/// similarity, assuming known population sigma.
pub fn student_confidence_interval(
    scores: &[f64],
    sigma: f64,
    conf_level: f64,
    fpc_population: Option<usize>,
) -> Result<(f64, f64), AnalysisError> {
    let n = scores.len();
    let se = standard_error(n, sigma, fpc_population)?;
    let mean = scores.iter().sum::<f64>() / n as f64;

    let alpha = 1.0 - conf_level;
    let z_crit = Normal::standard().inverse_cdf(1.0 - alpha / 2.0);

    Ok((mean - z_crit * se, mean + z_crit * se))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(s1: u128, s2: u128, pct: f64) -> SimilarityFact {
        SimilarityFact {
            id: Uuid::new_v4(),
            assignment_id: Uuid::from_u128(1),
            submission_id_1: Uuid::from_u128(s1),
            submission_id_2: Uuid::from_u128(s2),
            student_id_1: Uuid::from_u128(s1),
            student_id_2: Uuid::from_u128(s2),
            percentage: pct,
            match_id: 1,
        }
    }

    #[test]
    fn aggregator_credits_both_participants_once() {
        let facts = vec![fact(1, 2, 30.0), fact(1, 3, 50.0), fact(2, 3, 20.0)];
        let scores = scores_by_submission(&facts);

        assert_eq!(scores.len(), 3);
        assert_eq!(scores[&Uuid::from_u128(1)], vec![30.0, 50.0]);
        assert_eq!(scores[&Uuid::from_u128(2)], vec![30.0, 20.0]);
        assert_eq!(scores[&Uuid::from_u128(3)], vec![50.0, 20.0]);
    }

    #[test]
    fn aggregator_skips_non_canonical_rows() {
        // A reversed duplicate must not double-count the pair.
        let facts = vec![fact(1, 2, 30.0), fact(2, 1, 30.0)];
        let scores = scores_by_submission(&facts);

        assert_eq!(scores[&Uuid::from_u128(1)], vec![30.0]);
        assert_eq!(scores[&Uuid::from_u128(2)], vec![30.0]);
    }

    #[test]
    fn aggregator_returns_empty_map_for_no_facts() {
        assert!(scores_by_submission(&[]).is_empty());
    }

    #[test]
    fn population_stats_divide_by_n() {
        let facts = vec![fact(1, 2, 30.0), fact(1, 3, 50.0), fact(2, 3, 20.0)];
        let scores = scores_by_submission(&facts);
        let (mu, sigma) = population_stats(&scores).unwrap();

        // Flattened population is each pair counted once per participant; the
        // mean is 200/6 and the variance uses N, not N-1.
        assert!((mu - 33.333333).abs() < 1e-5);
        assert!((sigma - (1400.0f64 / 9.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn population_stats_reject_empty() {
        let scores = HashMap::new();
        assert_eq!(
            population_stats(&scores).unwrap_err(),
            AnalysisError::EmptyPopulation
        );
    }

    #[test]
    fn z_score_matches_hand_computation() {
        let (mu, sigma) = (33.333333333333336, (1400.0f64 / 9.0).sqrt());
        let (mean, z) = student_z_score(&[30.0, 50.0], mu, sigma, Some(3)).unwrap();

        assert!((mean - 40.0).abs() < 1e-9);
        let se = sigma / 2.0f64.sqrt() * (1.0f64 / 2.0).sqrt();
        assert!((z - (40.0 - mu) / se).abs() < 1e-9);
    }

    #[test]
    fn z_score_rejects_empty_sample() {
        let err = student_z_score(&[], 10.0, 2.0, None).unwrap_err();
        assert_eq!(err, AnalysisError::InvalidSampleSize { n: 0, population: 0 });
    }

    #[test]
    fn z_score_rejects_population_not_exceeding_sample() {
        let err = student_z_score(&[1.0, 2.0], 10.0, 2.0, Some(2)).unwrap_err();
        assert_eq!(err, AnalysisError::InvalidSampleSize { n: 2, population: 2 });
    }

    #[test]
    fn confidence_interval_is_symmetric_around_mean() {
        let (lo, hi) = student_confidence_interval(&[30.0, 50.0], 10.0, 0.95, None).unwrap();
        let mean = 40.0;
        assert!((mean - lo - (hi - mean)).abs() < 1e-9);

        // z_crit for 95% is ~1.959964
        let se = 10.0 / 2.0f64.sqrt();
        assert!((hi - mean - 1.959964 * se).abs() < 1e-4);
    }

    #[test]
    fn fpc_narrows_the_interval() {
        let (lo_plain, hi_plain) =
            student_confidence_interval(&[30.0, 50.0], 10.0, 0.95, None).unwrap();
        let (lo_fpc, hi_fpc) =
            student_confidence_interval(&[30.0, 50.0], 10.0, 0.95, Some(10)).unwrap();

        assert!(hi_fpc - lo_fpc < hi_plain - lo_plain);
    }
}
