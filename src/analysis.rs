use crate::annotations::{AnnotationStore, Feature};
use crate::error::DesignError;
use crate::faidx::ReferenceStore;
use crate::repeats::{find_repeats, merge_locus_repeats, LocusRepeatMap, RepeatMap};
use crate::window::Target;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Marker-content report for one candidate target.
#[derive(Debug, Clone)]
pub struct TargetAnalysis {
    pub target: Target,
    /// Repeats found in the reference sequence of the target span.
    pub ssrs: RepeatMap,
    /// Repeats found in the alternate alleles of overlapping variants,
    /// keyed by locus.
    pub ssr_variants: LocusRepeatMap,
    /// Sum of per-site nucleotide diversity; defined only when every
    /// overlapping record has a nonzero call rate.
    pub pi: Option<f64>,
    pub min_call_rate: Option<f64>,
}

/// Analyse every target against the reference and the variant annotations.
pub fn analyze_targets(
    targets: &[Target],
    reference: &ReferenceStore,
    annotations: &AnnotationStore,
) -> Result<Vec<TargetAnalysis>, DesignError> {
    let mut analyses = Vec::with_capacity(targets.len());
    for target in targets {
        let sequence = reference.fetch_sequence(&target.chrom, target.start, target.end)?;
        let overlapping = annotations.fetch(&target.chrom, target.start, target.end)?;

        let mut ssr_variants = LocusRepeatMap::default();
        for feature in &overlapping {
            for allele in &feature.alt_alleles {
                merge_locus_repeats(&mut ssr_variants, feature.locus_key(), find_repeats(allele));
            }
        }

        analyses.push(TargetAnalysis {
            target: target.clone(),
            ssrs: find_repeats(&sequence),
            ssr_variants,
            pi: diversity_sum(&overlapping),
            min_call_rate: overlapping
                .iter()
                .filter_map(|f| f.call_rate)
                .min_by(|a, b| a.total_cmp(b)),
        });
    }
    info!("Analysed {} targets", analyses.len());
    Ok(analyses)
}

/// Summed nucleotide diversity over the records; undefined as soon as one
/// record has a missing or zero call rate.
fn diversity_sum(features: &[Feature]) -> Option<f64> {
    if !features
        .iter()
        .all(|f| f.call_rate.is_some_and(|rate| rate != 0.0))
    {
        return None;
    }
    Some(features.iter().filter_map(|f| f.nucl_diversity).sum())
}

/// Minimum repeat count required per repeat-unit length; either a floor or
/// an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RepeatThreshold {
    Min(usize),
    Range(usize, usize),
}

impl RepeatThreshold {
    fn matches(&self, count: usize) -> bool {
        match *self {
            RepeatThreshold::Min(min) => count >= min,
            RepeatThreshold::Range(lo, hi) => lo <= count && count <= hi,
        }
    }
}

/// Repeat thresholds keyed by unit length.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SsrThresholds(pub BTreeMap<usize, RepeatThreshold>);

impl Default for SsrThresholds {
    fn default() -> Self {
        // Dinucleotide repeats are ubiquitous, so they need 10 copies to
        // count as a marker; longer units only 2
        let mut map = BTreeMap::new();
        map.insert(2, RepeatThreshold::Min(10));
        for length in 3..=10 {
            map.insert(length, RepeatThreshold::Min(2));
        }
        SsrThresholds(map)
    }
}

impl SsrThresholds {
    fn matches_map(&self, repeats: &RepeatMap) -> bool {
        self.0.iter().any(|(&length, threshold)| {
            repeats.iter().any(|(pattern, counts)| {
                pattern.len() == length && counts.iter().any(|&count| threshold.matches(count))
            })
        })
    }

    fn matches_locus_map(&self, report: &LocusRepeatMap) -> bool {
        report.values().any(|repeats| self.matches_map(repeats))
    }
}

/// Which criteria gate a target, and with what limits. Disabled criteria
/// are `None`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub ssrs: Option<SsrThresholds>,
    pub ssr_variants: Option<SsrThresholds>,
    pub pi_min: Option<f64>,
    pub call_rate_min: Option<f64>,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        FilterCriteria {
            ssrs: Some(SsrThresholds::default()),
            ssr_variants: Some(SsrThresholds::default()),
            pi_min: Some(0.5),
            call_rate_min: Some(0.5),
        }
    }
}

impl FilterCriteria {
    pub fn from_json(json: &str) -> Result<Self, DesignError> {
        serde_json::from_str(json)
            .map_err(|e| DesignError::InvalidInput(format!("invalid filter criteria: {e}")))
    }

    /// A target is retained only when every enabled criterion holds.
    pub fn retains(&self, analysis: &TargetAnalysis) -> bool {
        if let Some(thresholds) = &self.ssrs {
            if !thresholds.matches_map(&analysis.ssrs) {
                return false;
            }
        }
        if let Some(thresholds) = &self.ssr_variants {
            if !thresholds.matches_locus_map(&analysis.ssr_variants) {
                return false;
            }
        }
        if let Some(pi_min) = self.pi_min {
            if !analysis.pi.is_some_and(|pi| pi >= pi_min) {
                return false;
            }
        }
        if let Some(rate_min) = self.call_rate_min {
            if !analysis
                .min_call_rate
                .is_some_and(|rate| rate >= rate_min)
            {
                return false;
            }
        }
        true
    }
}

/// Apply the criteria, returning the retained targets in input order.
pub fn filter_targets(analyses: &[TargetAnalysis], criteria: &FilterCriteria) -> Vec<Target> {
    let retained: Vec<Target> = analyses
        .iter()
        .filter(|analysis| criteria.retains(analysis))
        .map(|analysis| analysis.target.clone())
        .collect();
    info!(
        "Filter retained {} of {} targets",
        retained.len(),
        analyses.len()
    );
    retained
}

#[derive(Serialize)]
struct AnalysisRow<'a> {
    #[serde(rename = "CHR")]
    chrom: &'a str,
    #[serde(rename = "START")]
    start: i64,
    #[serde(rename = "END")]
    end: i64,
    #[serde(rename = "SSRs")]
    ssrs: String,
    #[serde(rename = "SSRs_variants")]
    ssr_variants: String,
    #[serde(rename = "PI")]
    pi: String,
    #[serde(rename = "min_call_rate")]
    min_call_rate: String,
}

/// Deterministic text form of a repeat map: `AT:3+2;ACG:2`, keys sorted.
pub fn format_repeat_map(repeats: &RepeatMap) -> String {
    let sorted: BTreeMap<&String, &Vec<usize>> = repeats.iter().collect();
    sorted
        .iter()
        .map(|(pattern, counts)| {
            let counts: Vec<String> = counts.iter().map(|c| c.to_string()).collect();
            format!("{pattern}:{}", counts.join("+"))
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn format_locus_map(report: &LocusRepeatMap) -> String {
    let sorted: BTreeMap<&String, &RepeatMap> = report.iter().collect();
    sorted
        .iter()
        .map(|(locus, repeats)| format!("{locus}{{{}}}", format_repeat_map(repeats)))
        .collect::<Vec<_>>()
        .join("|")
}

/// Write the analysis report as CSV.
pub fn write_analysis_csv(analyses: &[TargetAnalysis], path: &Path) -> Result<(), DesignError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| DesignError::InvalidInput(format!("cannot write {path:?}: {e}")))?;
    for analysis in analyses {
        writer
            .serialize(AnalysisRow {
                chrom: &analysis.target.chrom,
                start: analysis.target.start,
                end: analysis.target.end,
                ssrs: format_repeat_map(&analysis.ssrs),
                ssr_variants: format_locus_map(&analysis.ssr_variants),
                pi: analysis.pi.map(|v| v.to_string()).unwrap_or_default(),
                min_call_rate: analysis
                    .min_call_rate
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            })
            .map_err(|e| DesignError::InvalidInput(format!("CSV write failed: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| DesignError::InvalidInput(format!("CSV flush failed: {e}")))?;
    Ok(())
}
