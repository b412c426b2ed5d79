//! Integration test for the full marker design pipeline:
//! scan -> analyze -> design, driven through the library API with a
//! scripted oracle standing in for primer3.

use pcrmd::analysis::{analyze_targets, filter_targets, FilterCriteria};
use pcrmd::annotations::{AnnotationStore, FileKind};
use pcrmd::commands::design::{design_targets, run_design};
use pcrmd::error::DesignError;
use pcrmd::faidx::ReferenceStore;
use pcrmd::oracle::{DesignTask, OracleOutput, Primer3Params, PrimerOracle};
use pcrmd::targets::{read_targets_bed, scan_targets};
use pcrmd::window::{SizeRanges, Target};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Oracle answering every task with the same single candidate pair.
struct ScriptedOracle;

impl PrimerOracle for ScriptedOracle {
    fn design(
        &self,
        task: &DesignTask,
        params: &Primer3Params,
    ) -> Result<OracleOutput, DesignError> {
        // The pipeline must hand the oracle a template and the size limits.
        assert!(!task.template.is_empty());
        assert_eq!(params.product_size_range, (200, 300));
        OracleOutput::parse_boulder(
            "PRIMER_PAIR_NUM_RETURNED=1\n\
             PRIMER_LEFT_NUM_RETURNED=1\n\
             PRIMER_RIGHT_NUM_RETURNED=1\n\
             PRIMER_LEFT_0=10,20\n\
             PRIMER_LEFT_0_SEQUENCE=ACGTACGTACGTACGTACGT\n\
             PRIMER_LEFT_0_TM=59.5\n\
             PRIMER_LEFT_0_GC_PERCENT=50.0\n\
             PRIMER_LEFT_0_PENALTY=0.11\n\
             PRIMER_RIGHT_0=229,20\n\
             PRIMER_RIGHT_0_SEQUENCE=TGCATGCATGCATGCATGCA\n\
             PRIMER_RIGHT_0_TM=60.2\n\
             PRIMER_RIGHT_0_GC_PERCENT=50.0\n\
             PRIMER_RIGHT_0_PENALTY=0.23\n\
             PRIMER_PAIR_0_PENALTY=0.34\n\
             PRIMER_PAIR_0_COMPL_ANY=2.0\n\
             PRIMER_PAIR_0_COMPL_END=0.0\n\
             PRIMER_PAIR_0_PRODUCT_SIZE=220\n\
             =\n",
        )
    }
}

/// 6 kb reference with a (AT)x12 tract at 2000 so the analyze step has a
/// repeat to find.
fn write_reference(dir: &Path) -> String {
    let mut sequence = String::new();
    while sequence.len() < 6000 {
        sequence.push_str("ACGTTGCAAC");
    }
    sequence.replace_range(2000..2024, &"AT".repeat(12));

    let path = dir.join("ref.fa");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, ">CHR1").unwrap();
    for chunk in sequence.as_bytes().chunks(60) {
        writeln!(file, "{}", std::str::from_utf8(chunk).unwrap()).unwrap();
    }
    path.to_str().unwrap().to_string()
}

#[test]
fn test_scan_analyze_design_roundtrip() {
    let dir = TempDir::new().unwrap();
    let reference_path = write_reference(dir.path());
    let sizes = SizeRanges::default();

    // Variant features clustered tightly enough to merge into one target.
    let bed_path = dir.path().join("variants.bed");
    fs::write(
        &bed_path,
        "CHR1\t2000\t2001\nCHR1\t2010\t2011\nCHR1\t2200\t2201\n",
    )
    .unwrap();
    let annotations =
        AnnotationStore::open(bed_path.to_str().unwrap(), FileKind::Bed).unwrap();

    let features = annotations.fetch_all().unwrap();
    let targets = scan_targets(&features, &sizes);
    assert!(!targets.is_empty());
    // The merged 2000-2011 cluster and the 2200-2201 feature span 201 bp,
    // inside the allowed target range.
    assert!(targets.contains(&Target::new("CHR1", 2000, 2201)));

    // Analyze: the AT tract must show up; variant-derived criteria are
    // disabled because BED features carry no alleles.
    let reference = ReferenceStore::open(&reference_path).unwrap();
    let analyses = analyze_targets(&targets, &reference, &annotations).unwrap();
    let tract = analyses
        .iter()
        .find(|a| a.target.start == 2000 && a.target.end == 2201)
        .unwrap();
    assert_eq!(tract.ssrs.get("AT"), Some(&vec![12]));

    let criteria = FilterCriteria {
        ssr_variants: None,
        pi_min: None,
        call_rate_min: None,
        ..Default::default()
    };
    let retained = filter_targets(&analyses, &criteria);
    assert!(retained.contains(&Target::new("CHR1", 2000, 2201)));

    // Design the retained targets with the scripted oracle.
    let reports = design_targets(
        &retained,
        &reference,
        Some(&annotations),
        &sizes,
        &Primer3Params::default(),
        &ScriptedOracle,
        "roundtrip",
    )
    .unwrap();
    assert_eq!(reports.len(), retained.len());
    let report = &reports[0];
    // Window start for the 2000-2201 target: 2201 + 18 - 300.
    assert_eq!(report.ref_offset, 1919);
    assert_eq!(report.candidates.len(), 1);
    assert_eq!(
        report.candidates[0].amplicon_region("CHR1", report.ref_offset),
        "CHR1:1930-2149"
    );
}

#[test]
fn test_design_command_writes_all_tables() {
    let dir = TempDir::new().unwrap();
    let reference_path = write_reference(dir.path());

    let targets_path = dir.path().join("targets.bed");
    fs::write(&targets_path, "CHR1\t2000\t2024\nCHR1\t4000\t4002\n").unwrap();
    let out_dir = dir.path().join("out");

    run_design(
        &reference_path,
        Some(targets_path.to_str().unwrap()),
        None,
        None,
        &SizeRanges::default(),
        &Primer3Params::default(),
        &ScriptedOracle,
        "demo",
        Some(&out_dir),
    )
    .unwrap();

    let amplicons = fs::read_to_string(out_dir.join("amplicons_demo.csv")).unwrap();
    let mut lines = amplicons.lines();
    assert!(lines
        .next()
        .unwrap()
        .starts_with("SEQUENCE_ID,TARGET_ID,CHROMOSOME,REF_OFFSET,START,END"));
    assert_eq!(lines.count(), 2);
    assert!(amplicons.contains("demo,CHR1:2000-2024,CHR1"));
    assert!(amplicons.contains("demo,CHR1:4000-4002,CHR1"));

    let primers = fs::read_to_string(out_dir.join("primers_demo.csv")).unwrap();
    // Two rows per amplicon, one per side.
    assert_eq!(primers.lines().count(), 5);

    let bed = fs::read_to_string(out_dir.join("amplicons_demo.bed")).unwrap();
    for line in bed.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], "CHR1");
        let start: i64 = fields[1].parse().unwrap();
        let end: i64 = fields[2].parse().unwrap();
        assert!(start < end);
    }
}

#[test]
fn test_oversized_targets_are_dropped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let reference_path = write_reference(dir.path());
    let reference = ReferenceStore::open(&reference_path).unwrap();

    let targets_path = dir.path().join("targets.bed");
    // 300 bp span cannot fit a 300 bp amplicon with 18 bp primers.
    fs::write(&targets_path, "CHR1\t1000\t1300\nCHR1\t2000\t2024\n").unwrap();
    let targets = read_targets_bed(targets_path.to_str().unwrap()).unwrap();

    let reports = design_targets(
        &targets,
        &reference,
        None,
        &SizeRanges::default(),
        &Primer3Params::default(),
        &ScriptedOracle,
        "demo",
    )
    .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].target_id, "CHR1:2000-2024");
}
