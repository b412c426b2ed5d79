use crate::annotations::AnnotationStore;
use crate::assemble::{assemble, write_tables};
use crate::error::DesignError;
use crate::faidx::ReferenceStore;
use crate::oracle::{call_oracle, Primer3Params, PrimerOracle, TargetReport};
use crate::targets::{
    read_targets_bed, restrict_targets, scan_targets_in_regions, write_targets_bed, RegionMap,
};
use crate::window::{build_window, SizeRanges, Target};
use log::{info, warn};
use rayon::prelude::*;
use std::io::{self, Write};
use std::path::Path;

/// Run the oracle for every target and collect the reports in input order.
///
/// Targets whose span cannot fit the configured sizes are logged and
/// skipped; any other failure aborts the run.
pub fn design_targets<O: PrimerOracle + Sync>(
    targets: &[Target],
    reference: &ReferenceStore,
    annotations: Option<&AnnotationStore>,
    sizes: &SizeRanges,
    params: &Primer3Params,
    oracle: &O,
    description: &str,
) -> Result<Vec<TargetReport>, DesignError> {
    let reports: Vec<Option<TargetReport>> = targets
        .par_iter()
        .map(|target| design_one(target, reference, annotations, sizes, params, oracle, description))
        .collect::<Result<_, _>>()?;

    let skipped = reports.iter().filter(|r| r.is_none()).count();
    if skipped > 0 {
        warn!("Skipped {skipped} of {} targets", targets.len());
    }
    Ok(reports.into_iter().flatten().collect())
}

fn design_one<O: PrimerOracle>(
    target: &Target,
    reference: &ReferenceStore,
    annotations: Option<&AnnotationStore>,
    sizes: &SizeRanges,
    params: &Primer3Params,
    oracle: &O,
    description: &str,
) -> Result<Option<TargetReport>, DesignError> {
    let contig_length = reference.contig_length(&target.chrom)?;

    // Fetch over a superset of the window; the window builder clips
    // features down to the flanks.
    let features = match annotations {
        Some(store) => {
            let fetch_start = (target.end - sizes.amplicon.1).max(0);
            let fetch_end = (target.start + sizes.amplicon.1).min(contig_length);
            store.fetch(&target.chrom, fetch_start, fetch_end)?
        }
        None => Vec::new(),
    };

    let window = match build_window(target, sizes, contig_length, &features) {
        Ok(window) => window,
        Err(DesignError::InvalidTargetSize { max_span, .. }) => {
            warn!("Target {target} wider than {max_span} bp, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let template = reference.fetch_sequence(&window.chrom, window.start, window.end)?;
    call_oracle(oracle, &window, target, template, description, params).map(Some)
}

/// The `design` subcommand: read (or scan for) targets, design primers for
/// each, and write the amplicon and primer tables.
#[allow(clippy::too_many_arguments)]
pub fn run_design<O: PrimerOracle + Sync>(
    reference_path: &str,
    targets_path: Option<&str>,
    annotations: Option<&AnnotationStore>,
    regions: Option<&RegionMap>,
    sizes: &SizeRanges,
    params: &Primer3Params,
    oracle: &O,
    description: &str,
    output_dir: Option<&Path>,
) -> io::Result<()> {
    let reference = ReferenceStore::open(reference_path)?;
    let (targets, scanned) = match targets_path {
        Some(path) => {
            let mut targets = read_targets_bed(path)?;
            if let Some(regions) = regions {
                targets = restrict_targets(targets, regions);
            }
            (targets, false)
        }
        // Without a targets file, derive targets by scanning the annotation
        // features themselves.
        None => {
            let store = annotations.ok_or_else(|| {
                DesignError::InvalidInput(
                    "no targets file given and no annotations to scan for targets".to_string(),
                )
            })?;
            let features = store.fetch_all()?;
            let empty = RegionMap::default();
            let targets =
                scan_targets_in_regions(&features, sizes, regions.unwrap_or(&empty));
            info!("Scanned {} targets from annotations", targets.len());
            (targets, true)
        }
    };
    info!("Designing primers for {} targets", targets.len());

    let reports = design_targets(
        &targets,
        &reference,
        annotations,
        sizes,
        params,
        oracle,
        description,
    )?;
    let tables = assemble(&reports);
    info!(
        "Assembled {} amplicons and {} primers",
        tables.amplicons.len(),
        tables.primers.len()
    );

    match output_dir {
        Some(dir) => {
            write_tables(&tables, dir, description)?;
            if scanned {
                write_targets_bed(&targets, &dir.join(format!("targets_{description}.bed")))?;
            }
        }
        None => write_reports(&reports, io::stdout().lock())?,
    }
    Ok(())
}

/// Stdout mode: each report as a Boulder-style record, before any
/// assembly or deduplication.
fn write_reports<W: Write>(reports: &[TargetReport], mut writer: W) -> io::Result<()> {
    for report in reports {
        writeln!(writer, "SEQUENCE_ID={}", report.sequence_id)?;
        writeln!(writer, "TARGET_ID={}", report.target_id)?;
        writeln!(writer, "CHROMOSOME={}", report.chrom)?;
        writeln!(writer, "REF_OFFSET={}", report.ref_offset)?;
        for pair in &report.candidates {
            let i = pair.index;
            writeln!(writer, "PRIMER_LEFT_{i}={},{}", pair.left.position, pair.left.length)?;
            writeln!(writer, "PRIMER_LEFT_{i}_SEQUENCE={}", pair.left.sequence)?;
            writeln!(
                writer,
                "PRIMER_RIGHT_{i}={},{}",
                pair.right.position, pair.right.length
            )?;
            writeln!(writer, "PRIMER_RIGHT_{i}_SEQUENCE={}", pair.right.sequence)?;
            writeln!(
                writer,
                "AMPLICON_REGION_{i}={}",
                pair.amplicon_region(&report.chrom, report.ref_offset)
            )?;
        }
        writeln!(writer, "=")?;
    }
    Ok(())
}
