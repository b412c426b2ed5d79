use crate::annotations::Feature;
use crate::error::DesignError;
use log::debug;
use std::fmt;

/// A locus selected for primer design, as a half-open genome interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
}

impl Target {
    pub fn new(chrom: &str, start: i64, end: i64) -> Self {
        Target {
            chrom: chrom.to_string(),
            start,
            end,
        }
    }

    pub fn span(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// Amplicon and primer length limits, both as (min, max).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRanges {
    pub amplicon: (i64, i64),
    pub primer: (i64, i64),
}

impl Default for SizeRanges {
    fn default() -> Self {
        SizeRanges {
            amplicon: (200, 300),
            primer: (18, 25),
        }
    }
}

impl SizeRanges {
    /// Largest target span that still leaves room for a flanking primer pair.
    pub fn max_target_span(&self) -> i64 {
        self.amplicon.1 - 2 * self.primer.0
    }

    /// Span limits for targets produced by the annotation scan.
    pub fn target_span_range(&self) -> (i64, i64) {
        (
            self.amplicon.0 - 2 * self.primer.1,
            self.amplicon.1 - 2 * self.primer.0,
        )
    }
}

/// A (window-local start, length) interval the oracle must keep primers out
/// of.
pub type ExcludedRegion = (i64, i64);

/// Genome window around a target, carrying the coordinates needed to map the
/// oracle's window-local output back to genome space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignWindow {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    /// Equal to `start`; genome coordinate = local coordinate + offset.
    pub offset: i64,
    /// Target span in window-local coordinates, as (start, length).
    pub local_target: (i64, i64),
    pub excluded_regions: Vec<ExcludedRegion>,
}

impl DesignWindow {
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Build the design window for `target`.
///
/// The bounds are chosen so that every primer pair within the configured
/// size ranges that flanks the target lies inside the window:
/// `start = max(0, target.end + primer_min - amplicon_max)` and
/// `end = min(contig_length, target.start - primer_min + amplicon_max)`.
///
/// Features overlapping the window contribute excluded regions only for the
/// parts that lie between a window boundary and the target edge. A feature
/// wholly inside the target contributes nothing: known variation is allowed
/// inside the amplicon, only the flanking sequence must stay clear of it.
pub fn build_window(
    target: &Target,
    sizes: &SizeRanges,
    contig_length: i64,
    features: &[Feature],
) -> Result<DesignWindow, DesignError> {
    let max_span = sizes.max_target_span();
    if target.span() >= max_span {
        return Err(DesignError::InvalidTargetSize {
            chrom: target.chrom.clone(),
            start: target.start,
            end: target.end,
            span: target.span(),
            max_span,
        });
    }

    let start = (target.end + sizes.primer.0 - sizes.amplicon.1).max(0);
    let end = (target.start - sizes.primer.0 + sizes.amplicon.1).min(contig_length);
    let offset = start;

    let mut excluded_regions = Vec::new();
    for feature in features {
        feature.validate()?;
        // Left flank: the part of the feature between the window start and
        // the target start
        if feature.start < target.start {
            let clip_start = feature.start.max(start);
            let clip_end = feature.stop.min(target.start);
            if clip_end > clip_start {
                excluded_regions.push((clip_start - offset, clip_end - clip_start));
            }
        }
        // Right flank, symmetric
        if feature.stop > target.end {
            let clip_start = feature.start.max(target.end);
            let clip_end = feature.stop.min(end);
            if clip_end > clip_start {
                excluded_regions.push((clip_start - offset, clip_end - clip_start));
            }
        }
    }

    debug!(
        "Window for {}: {}:{}-{} (offset {}, {} excluded regions)",
        target,
        target.chrom,
        start,
        end,
        offset,
        excluded_regions.len()
    );

    Ok(DesignWindow {
        chrom: target.chrom.clone(),
        start,
        end,
        offset,
        local_target: (target.start - offset, target.span()),
        excluded_regions,
    })
}
