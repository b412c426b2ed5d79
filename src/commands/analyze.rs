use crate::analysis::{analyze_targets, filter_targets, write_analysis_csv, FilterCriteria};
use crate::annotations::AnnotationStore;
use crate::faidx::ReferenceStore;
use crate::targets::{read_targets_bed, restrict_targets, write_targets_bed, RegionMap};
use log::info;
use std::io;
use std::path::Path;

/// The `analyze` subcommand: score each target for repeat content, diversity
/// and call rate, write the per-target report, and optionally the targets
/// that pass the filter.
pub fn run_analyze(
    reference_path: &str,
    targets_path: &str,
    annotations: &AnnotationStore,
    regions: Option<&RegionMap>,
    criteria: &FilterCriteria,
    report_path: &Path,
    retained_path: Option<&Path>,
) -> io::Result<()> {
    let reference = ReferenceStore::open(reference_path)?;
    let mut targets = read_targets_bed(targets_path)?;
    if let Some(regions) = regions {
        targets = restrict_targets(targets, regions);
    }
    info!("Analysing {} targets", targets.len());

    let analyses = analyze_targets(&targets, &reference, annotations)?;
    write_analysis_csv(&analyses, report_path)?;

    if let Some(path) = retained_path {
        let retained = filter_targets(&analyses, criteria);
        write_targets_bed(&retained, path)?;
    }
    Ok(())
}
