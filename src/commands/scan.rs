use crate::annotations::AnnotationStore;
use crate::targets::{scan_targets_in_regions, write_targets_bed, RegionMap};
use crate::window::SizeRanges;
use log::info;
use std::io::{self, Write};
use std::path::Path;

/// The `scan` subcommand: derive candidate design targets from the variant
/// annotations and write them as BED.
pub fn run_scan(
    annotations: &AnnotationStore,
    regions: &RegionMap,
    sizes: &SizeRanges,
    output: Option<&Path>,
) -> io::Result<()> {
    let features = annotations.fetch_all()?;
    info!("Scanning {} annotation features", features.len());

    let targets = scan_targets_in_regions(&features, sizes, regions);

    match output {
        Some(path) => write_targets_bed(&targets, path)?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            for target in &targets {
                writeln!(handle, "{}\t{}\t{}", target.chrom, target.start, target.end)?;
            }
        }
    }
    Ok(())
}
