use crate::error::DesignError;
use crate::oracle::{CandidatePair, TargetReport};
use log::info;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One candidate amplicon in genome coordinates. Column names reproduce the
/// oracle's tag names with the candidate index stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AmpliconRow {
    #[serde(rename = "SEQUENCE_ID")]
    pub sequence_id: String,
    #[serde(rename = "TARGET_ID")]
    pub target_id: String,
    #[serde(rename = "CHROMOSOME")]
    pub chromosome: String,
    #[serde(rename = "REF_OFFSET")]
    pub ref_offset: i64,
    #[serde(rename = "START")]
    pub start: i64,
    #[serde(rename = "END")]
    pub end: i64,
    #[serde(rename = "PRIMER_LEFT")]
    pub primer_left: String,
    #[serde(rename = "PRIMER_RIGHT")]
    pub primer_right: String,
    #[serde(rename = "PRIMER_LEFT_REGION")]
    pub primer_left_region: String,
    #[serde(rename = "PRIMER_INTERNAL_REGION")]
    pub primer_internal_region: String,
    #[serde(rename = "PRIMER_RIGHT_REGION")]
    pub primer_right_region: String,
    #[serde(rename = "PRIMER_LEFT_SEQUENCE")]
    pub primer_left_sequence: String,
    #[serde(rename = "PRIMER_RIGHT_SEQUENCE")]
    pub primer_right_sequence: String,
    #[serde(rename = "PRIMER_INTERNAL_SEQUENCE")]
    pub primer_internal_sequence: String,
    #[serde(rename = "PRIMER_LEFT_TM")]
    pub primer_left_tm: String,
    #[serde(rename = "PRIMER_RIGHT_TM")]
    pub primer_right_tm: String,
    #[serde(rename = "PRIMER_LEFT_GC_PERCENT")]
    pub primer_left_gc_percent: String,
    #[serde(rename = "PRIMER_RIGHT_GC_PERCENT")]
    pub primer_right_gc_percent: String,
    #[serde(rename = "PRIMER_PAIR_PENALTY")]
    pub primer_pair_penalty: String,
    #[serde(rename = "PRIMER_PAIR_COMPL_ANY")]
    pub primer_pair_compl_any: String,
    #[serde(rename = "PRIMER_PAIR_COMPL_END")]
    pub primer_pair_compl_end: String,
    #[serde(rename = "PRIMER_PAIR_PRODUCT_SIZE")]
    pub primer_pair_product_size: String,
}

/// One primer (either strand) in genome coordinates; left and right rows
/// align under common, side-free column names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PrimerRow {
    #[serde(rename = "SEQUENCE_ID")]
    pub sequence_id: String,
    #[serde(rename = "TARGET_ID")]
    pub target_id: String,
    #[serde(rename = "CHROMOSOME")]
    pub chromosome: String,
    #[serde(rename = "REF_OFFSET")]
    pub ref_offset: i64,
    #[serde(rename = "START")]
    pub start: i64,
    #[serde(rename = "END")]
    pub end: i64,
    #[serde(rename = "PRIMER")]
    pub primer: String,
    #[serde(rename = "PRIMER_SEQUENCE")]
    pub primer_sequence: String,
    #[serde(rename = "PRIMER_TM")]
    pub primer_tm: String,
    #[serde(rename = "PRIMER_GC_PERCENT")]
    pub primer_gc_percent: String,
    #[serde(rename = "PRIMER_PENALTY")]
    pub primer_penalty: String,
}

#[derive(Debug, Default)]
pub struct AssembledTables {
    pub amplicons: Vec<AmpliconRow>,
    pub primers: Vec<PrimerRow>,
}

fn region(chrom: &str, start: i64, end: i64) -> String {
    format!("{chrom}:{start}-{end}")
}

fn amplicon_row(report: &TargetReport, pair: &CandidatePair) -> AmpliconRow {
    let offset = report.ref_offset;
    let chrom = report.chrom.as_str();
    let left = &pair.left;
    let right = &pair.right;

    // The right primer's reported position is its 3' (highest) base, so its
    // genome region is computed backwards from that end
    let internal_region = pair
        .internal
        .as_ref()
        .map(|site| {
            region(
                chrom,
                site.position + offset,
                site.position + offset + site.length,
            )
        })
        .unwrap_or_default();

    AmpliconRow {
        sequence_id: report.sequence_id.clone(),
        target_id: report.target_id.clone(),
        chromosome: report.chrom.clone(),
        ref_offset: offset,
        start: left.position + offset,
        end: right.position + offset + 1,
        primer_left: format!("{},{}", left.position, left.length),
        primer_right: format!("{},{}", right.position, right.length),
        primer_left_region: region(
            chrom,
            left.position + offset,
            left.position + offset + left.length,
        ),
        primer_internal_region: internal_region,
        primer_right_region: region(
            chrom,
            right.position + offset - right.length + 1,
            right.position + offset + 1,
        ),
        primer_left_sequence: left.sequence.clone(),
        primer_right_sequence: right.sequence.clone(),
        primer_internal_sequence: pair
            .internal
            .as_ref()
            .map(|site| site.sequence.clone())
            .unwrap_or_default(),
        primer_left_tm: left.tm.clone(),
        primer_right_tm: right.tm.clone(),
        primer_left_gc_percent: left.gc_percent.clone(),
        primer_right_gc_percent: right.gc_percent.clone(),
        primer_pair_penalty: pair.pair_penalty.clone(),
        primer_pair_compl_any: pair.pair_compl_any.clone(),
        primer_pair_compl_end: pair.pair_compl_end.clone(),
        primer_pair_product_size: pair.product_size.clone(),
    }
}

fn primer_rows(report: &TargetReport, pair: &CandidatePair) -> (PrimerRow, PrimerRow) {
    let offset = report.ref_offset;
    let shared = |start: i64, end: i64, site: &crate::oracle::PrimerSite| PrimerRow {
        sequence_id: report.sequence_id.clone(),
        target_id: report.target_id.clone(),
        chromosome: report.chrom.clone(),
        ref_offset: offset,
        start,
        end,
        primer: format!("{},{}", site.position, site.length),
        primer_sequence: site.sequence.clone(),
        primer_tm: site.tm.clone(),
        primer_gc_percent: site.gc_percent.clone(),
        primer_penalty: site.penalty.clone(),
    };

    let left = &pair.left;
    let right = &pair.right;
    (
        shared(
            left.position + offset,
            left.position + offset + left.length,
            left,
        ),
        shared(
            right.position + offset - right.length + 1,
            right.position + offset + 1,
            right,
        ),
    )
}

/// Unpack per-target oracle reports into genome-coordinate amplicon and
/// primer tables: one amplicon row and two primer rows per candidate,
/// exact-duplicate rows dropped, amplicons sorted by window offset and
/// primers by (chromosome, start).
///
/// Deduplication makes the operation idempotent: assembling the same
/// reports twice over yields the same tables as assembling them once.
pub fn assemble(reports: &[TargetReport]) -> AssembledTables {
    let mut amplicons = Vec::new();
    let mut primers = Vec::new();

    for report in reports {
        for pair in &report.candidates {
            amplicons.push(amplicon_row(report, pair));
            let (left_row, right_row) = primer_rows(report, pair);
            primers.push(left_row);
            primers.push(right_row);
        }
    }

    let mut seen_amplicons = FxHashSet::default();
    amplicons.retain(|row| seen_amplicons.insert(row.clone()));
    let mut seen_primers = FxHashSet::default();
    primers.retain(|row| seen_primers.insert(row.clone()));

    amplicons.sort_by_key(|row| row.ref_offset);
    primers.sort_by(|a, b| {
        a.chromosome
            .cmp(&b.chromosome)
            .then_with(|| a.start.cmp(&b.start))
    });

    AssembledTables { amplicons, primers }
}

/// Persist the tables as `amplicons_<name>.csv/.bed` and
/// `primers_<name>.csv/.bed` under `output_dir`. The BED companions carry
/// CHROMOSOME/START/END only, tab-separated, without a header.
pub fn write_tables(
    tables: &AssembledTables,
    output_dir: &Path,
    name: &str,
) -> Result<(), DesignError> {
    std::fs::create_dir_all(output_dir)?;

    let amplicons_csv = output_dir.join(format!("amplicons_{name}.csv"));
    let mut writer = csv::Writer::from_path(&amplicons_csv)
        .map_err(|e| DesignError::InvalidInput(format!("cannot write {amplicons_csv:?}: {e}")))?;
    for row in &tables.amplicons {
        writer
            .serialize(row)
            .map_err(|e| DesignError::InvalidInput(format!("CSV write failed: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| DesignError::InvalidInput(format!("CSV flush failed: {e}")))?;

    let primers_csv = output_dir.join(format!("primers_{name}.csv"));
    let mut writer = csv::Writer::from_path(&primers_csv)
        .map_err(|e| DesignError::InvalidInput(format!("cannot write {primers_csv:?}: {e}")))?;
    for row in &tables.primers {
        writer
            .serialize(row)
            .map_err(|e| DesignError::InvalidInput(format!("CSV write failed: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| DesignError::InvalidInput(format!("CSV flush failed: {e}")))?;

    let mut bed = BufWriter::new(File::create(
        output_dir.join(format!("amplicons_{name}.bed")),
    )?);
    for row in &tables.amplicons {
        writeln!(bed, "{}\t{}\t{}", row.chromosome, row.start, row.end)?;
    }
    bed.flush()?;

    let mut bed = BufWriter::new(File::create(output_dir.join(format!("primers_{name}.bed")))?);
    for row in &tables.primers {
        writeln!(bed, "{}\t{}\t{}", row.chromosome, row.start, row.end)?;
    }
    bed.flush()?;

    info!(
        "Wrote {} amplicon and {} primer rows to {}",
        tables.amplicons.len(),
        tables.primers.len(),
        output_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{CandidatePair, PrimerSite};

    fn site(position: i64, length: i64, sequence: &str) -> PrimerSite {
        PrimerSite {
            position,
            length,
            sequence: sequence.to_string(),
            tm: "60.0".to_string(),
            gc_percent: "50.0".to_string(),
            penalty: "0.1".to_string(),
        }
    }

    fn report(offset: i64, chrom: &str) -> TargetReport {
        TargetReport {
            sequence_id: "run1".to_string(),
            target_id: format!("{chrom}:{}-{}", offset + 281, offset + 282),
            chrom: chrom.to_string(),
            ref_offset: offset,
            candidates: vec![CandidatePair {
                index: 0,
                left: site(10, 20, "ACGTACGTACGTACGTACGT"),
                right: site(249, 20, "TGCATGCATGCATGCATGCA"),
                internal: None,
                pair_penalty: "0.2".to_string(),
                pair_compl_any: "3.0".to_string(),
                pair_compl_end: "1.0".to_string(),
                product_size: "240".to_string(),
            }],
        }
    }

    #[test]
    fn test_amplicon_coordinates() {
        let tables = assemble(&[report(4719, "CHR1")]);
        assert_eq!(tables.amplicons.len(), 1);
        let amplicon = &tables.amplicons[0];
        assert_eq!(amplicon.start, 4729);
        assert_eq!(amplicon.end, 4969);
        assert_eq!(amplicon.primer_left_region, "CHR1:4729-4749");
        // Right region runs backwards from the 3' base
        assert_eq!(amplicon.primer_right_region, "CHR1:4949-4969");
        assert_eq!(amplicon.primer_internal_region, "");
    }

    #[test]
    fn test_primer_rows_per_candidate() {
        let tables = assemble(&[report(4719, "CHR1")]);
        assert_eq!(tables.primers.len(), 2);
        let left = &tables.primers[0];
        assert_eq!((left.start, left.end), (4729, 4749));
        let right = &tables.primers[1];
        assert_eq!((right.start, right.end), (4949, 4969));
        // Both strands align under the shared local-position column
        assert_eq!(left.primer, "10,20");
        assert_eq!(right.primer, "249,20");
    }

    #[test]
    fn test_duplicate_reports_are_idempotent() {
        let once = assemble(&[report(4719, "CHR1"), report(100, "CHR2")]);
        let twice = assemble(&[
            report(4719, "CHR1"),
            report(100, "CHR2"),
            report(4719, "CHR1"),
            report(100, "CHR2"),
        ]);
        assert_eq!(once.amplicons, twice.amplicons);
        assert_eq!(once.primers, twice.primers);
    }

    #[test]
    fn test_sort_orders() {
        let tables = assemble(&[report(5000, "CHR2"), report(100, "CHR1")]);
        // Amplicons by window offset
        assert!(tables.amplicons[0].ref_offset < tables.amplicons[1].ref_offset);
        // Primers by (chromosome, start)
        let keys: Vec<(&str, i64)> = tables
            .primers
            .iter()
            .map(|row| (row.chromosome.as_str(), row.start))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_genome_roundtrip_against_independent_windowing() {
        use crate::window::{build_window, SizeRanges, Target};

        // local + offset must equal an independently computed genome
        // coordinate across many random-ish targets and configurations
        let mut checked = 0;
        for seed in 0..120u64 {
            let contig_length = 10_000 + (seed as i64 % 7) * 13_377;
            let start = (seed as i64 * 197) % (contig_length - 400);
            let target = Target::new("CHR1", start, start + 1 + (seed as i64 % 3));
            let sizes = SizeRanges {
                amplicon: (150 + (seed as i64 % 4) * 50, 300 + (seed as i64 % 4) * 50),
                primer: (18, 25),
            };
            let window = match build_window(&target, &sizes, contig_length, &[]) {
                Ok(window) => window,
                Err(_) => continue,
            };

            let local_left = 7 + (seed as i64 % 11);
            let mut rep = report(window.offset, "CHR1");
            rep.candidates[0].left.position = local_left;
            rep.candidates[0].right.position = local_left + 200;
            let tables = assemble(&[rep]);

            let expected_start =
                (target.end + sizes.primer.0 - sizes.amplicon.1).max(0) + local_left;
            assert_eq!(tables.amplicons[0].start, expected_start);
            assert_eq!(tables.amplicons[0].end, expected_start + 200 + 1);
            checked += 1;
        }
        assert!(checked >= 100);
    }

    #[test]
    fn test_write_tables_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let tables = assemble(&[report(4719, "CHR1")]);
        write_tables(&tables, dir.path(), "targets").unwrap();

        let csv_text =
            std::fs::read_to_string(dir.path().join("amplicons_targets.csv")).unwrap();
        assert!(csv_text.starts_with("SEQUENCE_ID,TARGET_ID,CHROMOSOME,REF_OFFSET,START,END"));
        assert!(csv_text.contains("4729"));

        let bed_text = std::fs::read_to_string(dir.path().join("primers_targets.bed")).unwrap();
        assert_eq!(bed_text, "CHR1\t4729\t4749\nCHR1\t4949\t4969\n");
    }
}
