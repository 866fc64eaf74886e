#![forbid(unsafe_code)]

//! Statistics engine for Wehe differentiation tests.
//!
//! A test compares the throughputs a client achieved during the original
//! replay against the bit-randomized replay. The verdict is a two-sample
//! Kolmogorov-Smirnov test, re-validated with the jackknife procedure from
//! the NetPolice paper: re-run the KS test `r` times on random half-size
//! subsets of both datasets and count how often the sub-tests agree with
//! the full test at significance `1 - alpha`.
//!
//! The KS statistic and its Smirnov asymptotic p-value are computed
//! natively; there is no external numeric dependency.

use rand::seq::index::sample;
use rand::Rng;
use thiserror::Error;

/// Significance level for the jackknife agreement check.
pub const ALPHA: f64 = 0.95;

/// Number of jackknife re-sampling rounds.
pub const JACKKNIFE_ROUNDS: usize = 100;

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("dataset is empty after removing zero samples")]
    DegenerateInput,
    #[error("subset size {requested} exceeds population {population}")]
    SampleTooLarge { requested: usize, population: usize },
}

/// A cleaned dataset together with its descriptive statistics.
///
/// Cleaning removes exact zeros: a zero throughput sample means the client
/// measured nothing in that window, and keeping it would drag every
/// statistic toward a stall that never happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetStats {
    pub data: Vec<f64>,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub median: f64,
    pub std_dev: f64,
}

impl DataSetStats {
    pub fn new(raw: &[f64]) -> Result<Self, AnalysisError> {
        let data: Vec<f64> = raw.iter().copied().filter(|v| *v != 0.0).collect();
        if data.is_empty() {
            return Err(AnalysisError::DegenerateInput);
        }

        let mut sorted = data.clone();
        sorted.sort_by(f64::total_cmp);

        let average = mean(&sorted);
        Ok(DataSetStats {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            average,
            median: empirical_quantile(&sorted, 0.5),
            std_dev: population_std_dev(&sorted, average),
            data,
        })
    }
}

/// Everything computed for one finished test.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResults {
    pub original_stats: DataSetStats,
    pub random_stats: DataSetStats,
    /// `mean(random) - mean(original)`.
    pub area: f64,
    /// Minimum sample across both cleaned datasets.
    pub xput_min: f64,
    /// `(mean(random) - mean(original)) / max(means)`.
    pub area0var: f64,
    pub ks2_d: f64,
    pub ks2_p: f64,
    pub jackknife_d_avg: f64,
    pub jackknife_p_avg: f64,
    pub jackknife_accept_ratio: f64,
}

/// Run the full analysis on the two replays' throughput samples.
///
/// The jackknife RNG is created once per call from OS entropy; tests that
/// need determinism call [`jackknife`] directly with a seeded generator.
pub fn analyze(original: &[f64], random: &[f64]) -> Result<AnalysisResults, AnalysisError> {
    let mut rng = rand::thread_rng();
    analyze_with_rng(original, random, &mut rng)
}

pub fn analyze_with_rng<R: Rng + ?Sized>(
    original: &[f64],
    random: &[f64],
    rng: &mut R,
) -> Result<AnalysisResults, AnalysisError> {
    let original_stats = DataSetStats::new(original)?;
    let random_stats = DataSetStats::new(random)?;

    let area = random_stats.average - original_stats.average;
    let xput_min = original_stats.min.min(random_stats.min);
    let area0var = area0var(original_stats.average, random_stats.average);

    let (ks2_d, ks2_p) = ks2_samp(&original_stats.data, &random_stats.data)?;
    let jack = jackknife(&original_stats.data, &random_stats.data, ks2_p, rng)?;

    Ok(AnalysisResults {
        original_stats,
        random_stats,
        area,
        xput_min,
        area0var,
        ks2_d,
        ks2_p,
        jackknife_d_avg: jack.d_avg,
        jackknife_p_avg: jack.p_avg,
        jackknife_accept_ratio: jack.accept_ratio,
    })
}

/// Normalized throughput gap: `(avg2 - avg1) / max(avg1, avg2)`.
pub fn area0var(avg1: f64, avg2: f64) -> f64 {
    (avg2 - avg1) / avg1.max(avg2)
}

/// Two-sample Kolmogorov-Smirnov test.
///
/// `D` is the supremum distance between the two empirical CDFs; the
/// p-value is the Smirnov asymptotic survival function evaluated at
/// `D * sqrt(n1 * n2 / (n1 + n2))`, against the null hypothesis that both
/// samples were drawn from one continuous distribution.
pub fn ks2_samp(data1: &[f64], data2: &[f64]) -> Result<(f64, f64), AnalysisError> {
    if data1.is_empty() || data2.is_empty() {
        return Err(AnalysisError::DegenerateInput);
    }

    let mut s1 = data1.to_vec();
    let mut s2 = data2.to_vec();
    s1.sort_by(f64::total_cmp);
    s2.sort_by(f64::total_cmp);

    let n1 = s1.len() as f64;
    let n2 = s2.len() as f64;

    let mut i = 0;
    let mut j = 0;
    let mut d: f64 = 0.0;
    while i < s1.len() && j < s2.len() {
        let x = s1[i].min(s2[j]);
        while i < s1.len() && s1[i] <= x {
            i += 1;
        }
        while j < s2.len() && s2[j] <= x {
            j += 1;
        }
        let gap = (i as f64 / n1 - j as f64 / n2).abs();
        if gap > d {
            d = gap;
        }
    }

    let en = (n1 * n2 / (n1 + n2)).sqrt();
    let p = kolmogorov_sf(d * en).clamp(0.0, 1.0);
    Ok((d, p))
}

/// Survival function of the Kolmogorov distribution:
/// `Q(x) = 2 * sum_{k>=1} (-1)^(k-1) * exp(-2 k^2 x^2)`.
fn kolmogorov_sf(x: f64) -> f64 {
    // Below this the alternating series needs thousands of terms and the
    // true value is 1 to machine precision anyway.
    if x < 1e-3 {
        return 1.0;
    }

    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=100 {
        let k = k as f64;
        let term = (-2.0 * k * k * x * x).exp();
        sum += sign * term;
        sign = -sign;
        if term < 1e-12 {
            break;
        }
    }
    2.0 * sum
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JackknifeSummary {
    pub d_avg: f64,
    pub p_avg: f64,
    pub accept_ratio: f64,
}

/// Jackknife re-validation of a KS verdict (NetPolice).
///
/// Draws half-size uniform subsets of both datasets without replacement,
/// re-runs the KS test, and counts the rounds that land on the same side
/// of `1 - ALPHA` as the original p-value.
pub fn jackknife<R: Rng + ?Sized>(
    data1: &[f64],
    data2: &[f64],
    ks2_p: f64,
    rng: &mut R,
) -> Result<JackknifeSummary, AnalysisError> {
    let greater = ks2_p >= 1.0 - ALPHA;

    let mut d_sum = 0.0;
    let mut p_sum = 0.0;
    let mut accept = 0usize;
    for _ in 0..JACKKNIFE_ROUNDS {
        let sub1 = random_subset(data1, data1.len() / 2, rng)?;
        let sub2 = random_subset(data2, data2.len() / 2, rng)?;
        let (d, p) = ks2_samp(&sub1, &sub2)?;
        d_sum += d;
        p_sum += p;

        let agrees = if greater {
            p > 1.0 - ALPHA
        } else {
            p < 1.0 - ALPHA
        };
        if agrees {
            accept += 1;
        }
    }

    let rounds = JACKKNIFE_ROUNDS as f64;
    Ok(JackknifeSummary {
        d_avg: d_sum / rounds,
        p_avg: p_sum / rounds,
        accept_ratio: accept as f64 / rounds,
    })
}

fn random_subset<R: Rng + ?Sized>(
    data: &[f64],
    size: usize,
    rng: &mut R,
) -> Result<Vec<f64>, AnalysisError> {
    if size > data.len() {
        return Err(AnalysisError::SampleTooLarge {
            requested: size,
            population: data.len(),
        });
    }
    if size == data.len() {
        return Ok(data.to_vec());
    }

    Ok(sample(rng, data.len(), size)
        .into_iter()
        .map(|i| data[i])
        .collect())
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// P50 by the empirical CDF: the smallest sample whose cumulative
/// probability reaches the quantile.
fn empirical_quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len() as f64;
    let idx = ((q * n).ceil() as usize).max(1) - 1;
    sorted[idx.min(sorted.len() - 1)]
}

fn population_std_dev(data: &[f64], mean: f64) -> f64 {
    let var = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / data.len() as f64;
    var.sqrt()
}
