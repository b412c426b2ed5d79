use crate::annotations::Feature;
use crate::error::DesignError;
use crate::window::{SizeRanges, Target};
use log::{debug, info};
use noodles::bgzf;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Genome regions restricting a run, as chromosome -> [start, stop) list.
/// `None` bounds in the source syntax become 0 / i64::MAX.
pub type RegionMap = FxHashMap<String, Vec<(i64, i64)>>;

/// Parse a comma-separated region list (`chr:from-to,chr:-to,chr:from-`).
pub fn parse_region_list(spec: &str) -> Result<RegionMap, DesignError> {
    let re = Regex::new(r"^([^:]+):([0-9]*)-([0-9]*)$").expect("static regex");
    let mut regions = RegionMap::default();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let captures = re.captures(part).ok_or_else(|| {
            DesignError::InvalidInput(format!(
                "region '{part}' does not match chr:from-to (open ends allowed)"
            ))
        })?;
        let parse_bound = |text: &str| {
            text.parse::<i64>().map_err(|_| {
                DesignError::InvalidInput(format!("region bound '{text}' in '{part}' out of range"))
            })
        };
        let start = if captures[2].is_empty() {
            0
        } else {
            parse_bound(&captures[2])?
        };
        let stop = if captures[3].is_empty() {
            i64::MAX
        } else {
            parse_bound(&captures[3])?
        };
        if stop <= start {
            return Err(DesignError::InvalidInput(format!(
                "region '{part}' is empty or inverted"
            )));
        }
        regions
            .entry(captures[1].to_string())
            .or_default()
            .push((start, stop));
    }
    Ok(regions)
}

/// Merge a regions BED file into `regions`.
pub fn add_regions_from_bed(regions: &mut RegionMap, path: &str) -> Result<(), DesignError> {
    for target in read_targets_bed(path)? {
        regions
            .entry(target.chrom)
            .or_default()
            .push((target.start, target.end));
    }
    Ok(())
}

/// Read a targets BED file (plain or bgzipped), in file order.
pub fn read_targets_bed(path: &str) -> Result<Vec<Target>, DesignError> {
    let file = File::open(path)
        .map_err(|e| DesignError::InvalidInput(format!("failed to open '{path}': {e}")))?;
    let reader: Box<dyn io::Read> = if [".gz", ".bgz"].iter().any(|e| path.ends_with(e)) {
        Box::new(bgzf::io::Reader::new(file))
    } else {
        Box::new(file)
    };
    let reader = BufReader::new(reader);

    let mut targets = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("track") {
            continue;
        }
        let parts: Vec<&str> = trimmed.split('\t').collect();
        if parts.len() < 3 {
            return Err(DesignError::InvalidInput(format!(
                "invalid BED line {} in '{path}': expected at least 3 fields",
                line_num + 1
            )));
        }
        let start = parts[1].parse::<i64>().map_err(|_| {
            DesignError::InvalidInput(format!("invalid start on line {} of '{path}'", line_num + 1))
        })?;
        let end = parts[2].parse::<i64>().map_err(|_| {
            DesignError::InvalidInput(format!("invalid end on line {} of '{path}'", line_num + 1))
        })?;
        if end < start {
            return Err(DesignError::MalformedFeature {
                chrom: parts[0].to_string(),
                start,
                stop: end,
            });
        }
        targets.push(Target::new(parts[0], start, end));
    }
    Ok(targets)
}

/// Restrict targets to those contained in one of the regions.
///
/// Containment (not mere overlap) is deliberate: a target poking out of the
/// requested region is dropped.
pub fn restrict_targets(targets: Vec<Target>, regions: &RegionMap) -> Vec<Target> {
    if regions.is_empty() {
        return targets;
    }
    targets
        .into_iter()
        .filter(|target| {
            regions.get(&target.chrom).is_some_and(|spans| {
                spans
                    .iter()
                    .any(|&(from, to)| target.start >= from && target.end <= to)
            })
        })
        .collect()
}

/// Write targets as a 3-column BED file.
pub fn write_targets_bed(targets: &[Target], path: &Path) -> Result<(), DesignError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for target in targets {
        writeln!(writer, "{}\t{}\t{}", target.chrom, target.start, target.end)?;
    }
    writer.flush()?;
    Ok(())
}

// A run of features merged because their gaps are too narrow for a primer
#[derive(Debug, Clone)]
struct Cluster {
    chrom: String,
    start: i64,
    stop: i64,
}

/// Derive design targets from the annotation features themselves.
///
/// Features closer than `primer_min` are merged into clusters. Whenever a
/// cluster closes, every suffix of the recent cluster run on the same
/// chromosome whose total span fits the target size limits becomes a
/// candidate target, so nearby variant groups are offered both individually
/// and combined.
pub fn scan_targets(features: &[Feature], sizes: &SizeRanges) -> Vec<Target> {
    let (span_min, span_max) = sizes.target_span_range();
    let primer_min = sizes.primer.0;

    let mut targets = Vec::new();
    let mut clusters: Vec<Cluster> = Vec::new();

    let flush = |clusters: &[Cluster], targets: &mut Vec<Target>| {
        let Some(last) = clusters.last() else { return };
        for earlier in clusters.iter().rev() {
            if earlier.chrom != last.chrom {
                break;
            }
            let span = last.stop - earlier.start;
            if span >= span_max {
                break;
            }
            if span > span_min {
                targets.push(Target::new(&last.chrom, earlier.start, last.stop));
            }
        }
    };

    for feature in features {
        match clusters.last_mut() {
            Some(last) if feature.chrom == last.chrom && feature.start < last.stop + primer_min => {
                last.stop = last.stop.max(feature.stop);
            }
            Some(last) => {
                let same_chrom = feature.chrom == last.chrom;
                flush(&clusters, &mut targets);
                if !same_chrom {
                    clusters.clear();
                }
                clusters.push(Cluster {
                    chrom: feature.chrom.clone(),
                    start: feature.start,
                    stop: feature.stop,
                });
            }
            None => clusters.push(Cluster {
                chrom: feature.chrom.clone(),
                start: feature.start,
                stop: feature.stop,
            }),
        }
    }
    flush(&clusters, &mut targets);

    debug!(
        "Scan produced {} candidate targets from {} features",
        targets.len(),
        features.len()
    );
    targets
}

/// Scan restricted to regions: features are filtered per region first, and
/// cluster runs never bridge two regions.
pub fn scan_targets_in_regions(
    features: &[Feature],
    sizes: &SizeRanges,
    regions: &RegionMap,
) -> Vec<Target> {
    if regions.is_empty() {
        return scan_targets(features, sizes);
    }

    let mut targets = Vec::new();
    let mut region_list: Vec<(&String, &(i64, i64))> = regions
        .iter()
        .flat_map(|(chrom, spans)| spans.iter().map(move |span| (chrom, span)))
        .collect();
    region_list.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));

    for (chrom, &(from, to)) in region_list {
        let slice: Vec<Feature> = features
            .iter()
            .filter(|f| &f.chrom == chrom && f.start >= from && f.stop <= to)
            .cloned()
            .collect();
        targets.extend(scan_targets(&slice, sizes));
    }

    info!(
        "Region-restricted scan produced {} candidate targets",
        targets.len()
    );
    targets
}
