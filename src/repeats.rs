use rustc_hash::FxHashMap;

/// Mapping from a minimal repeat unit to the repeat counts observed for it,
/// one entry per maximal run where the unit was found.
pub type RepeatMap = FxHashMap<String, Vec<usize>>;

/// Per-locus repeat report, keyed by `"CHR:start-end"`.
pub type LocusRepeatMap = FxHashMap<String, RepeatMap>;

/// Find simple sequence repeats in `seq`.
///
/// The scan walks left to right looking for the earliest position where some
/// substring is immediately followed by one or more exact copies of itself,
/// preferring the longest unit at that position. The matched run is reduced
/// to its minimal period; periods of length 1 (homopolymers) are discarded.
/// The recorded count is the number of non-overlapping occurrences of the
/// minimal unit in the whole string handed to that step of the scan, not
/// just inside the run. The scan then resumes strictly after the run.
pub fn find_repeats(seq: &str) -> RepeatMap {
    let mut result = RepeatMap::default();
    let mut rest = seq.as_bytes();

    while let Some((start, end)) = leftmost_repeat(rest) {
        let run = &rest[start..end];
        let period = minimal_period(run);
        if period > 1 {
            let unit = &run[..period];
            let count = count_occurrences(rest, unit);
            result
                .entry(String::from_utf8_lossy(unit).into_owned())
                .or_default()
                .push(count);
        }
        rest = &rest[end..];
    }

    result
}

/// Locate the leftmost tandem run in `s`, returning its half-open span.
///
/// At the leftmost starting position that admits any immediate repetition,
/// the longest repeating unit wins, then the run is extended over as many
/// further full copies of that unit as possible.
fn leftmost_repeat(s: &[u8]) -> Option<(usize, usize)> {
    let n = s.len();
    for i in 0..n {
        let max_unit = (n - i) / 2;
        for len in (1..=max_unit).rev() {
            if s[i..i + len] == s[i + len..i + 2 * len] {
                let mut end = i + 2 * len;
                while end + len <= n && s[end..end + len] == s[i..i + len] {
                    end += len;
                }
                return Some((i, end));
            }
        }
    }
    None
}

/// Smallest period of `run`: the offset of the second occurrence of `run`
/// inside `run` doubled, looking from index 1 onward.
fn minimal_period(run: &[u8]) -> usize {
    let doubled = [run, run].concat();
    for p in 1..=run.len() {
        if doubled[p..p + run.len()] == *run {
            return p;
        }
    }
    run.len()
}

/// Non-overlapping occurrence count of `unit` in `s`.
fn count_occurrences(s: &[u8], unit: &[u8]) -> usize {
    if unit.is_empty() || unit.len() > s.len() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + unit.len() <= s.len() {
        if &s[i..i + unit.len()] == unit {
            count += 1;
            i += unit.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Merge one allele's repeat map into a per-locus report.
///
/// Counts for a pattern shared across alleles at the same locus are
/// concatenated in discovery order, never summed or deduplicated.
pub fn merge_locus_repeats(report: &mut LocusRepeatMap, locus: String, found: RepeatMap) {
    if found.is_empty() {
        return;
    }
    let entry = report.entry(locus).or_default();
    for (pattern, mut counts) in found {
        entry.entry(pattern).or_default().append(&mut counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(find_repeats("").is_empty());
    }

    #[test]
    fn test_homopolymer_excluded() {
        // Single-base runs are matched but dropped by the length-1 gate
        assert!(find_repeats("AAAA").is_empty());
        assert!(find_repeats("TTTTTTTTTT").is_empty());
    }

    #[test]
    fn test_dinucleotide_run() {
        let found = find_repeats("ATATATG");
        assert_eq!(found.len(), 1);
        assert_eq!(found["AT"], vec![3]);
    }

    #[test]
    fn test_longest_unit_reduced_to_minimal_period() {
        // The run "ATATAT" could be seen as unit "ATAT" + partial copy; the
        // minimal-period reduction must land on "AT"
        let found = find_repeats("ATATAT");
        assert_eq!(found["AT"], vec![3]);
    }

    #[test]
    fn test_tetramer_with_trailing_noise() {
        let found = find_repeats("ACGTACGTACGTCCCTT");
        assert_eq!(found["ACGT"], vec![3]);
        // The trailing CCC and TT runs are homopolymers and must not appear
        assert!(!found.contains_key("C"));
        assert!(!found.contains_key("CC"));
        assert!(!found.contains_key("T"));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_count_spans_whole_string_not_just_run() {
        // "AT" repeats twice at the front; a third isolated "AT" later in the
        // string still contributes to the recorded count
        let found = find_repeats("ATATGGCAT");
        assert_eq!(found["AT"], vec![3]);
    }

    #[test]
    fn test_scan_resumes_after_run() {
        let found = find_repeats("ACGTACGTTTAGAGAG");
        assert_eq!(found["ACGT"], vec![2]);
        assert_eq!(found["AG"], vec![3]);
    }

    #[test]
    fn test_leftmost_position_wins() {
        // "CACA" starts at index 0 and must be found before the longer
        // "TGTGTG" run further right
        let found = find_repeats("CACATGTGTG");
        assert_eq!(found["CA"], vec![2]);
        assert_eq!(found["TG"], vec![3]);
    }

    #[test]
    fn test_minimal_period_helper() {
        assert_eq!(minimal_period(b"ATAT"), 2);
        assert_eq!(minimal_period(b"ACGTACGT"), 4);
        assert_eq!(minimal_period(b"AAAA"), 1);
        assert_eq!(minimal_period(b"ACGT"), 4);
    }

    #[test]
    fn test_merge_concatenates_counts() {
        let mut report = LocusRepeatMap::default();
        let mut a = RepeatMap::default();
        a.insert("AT".to_string(), vec![3]);
        let mut b = RepeatMap::default();
        b.insert("AT".to_string(), vec![2]);
        merge_locus_repeats(&mut report, "CHR1:100-101".to_string(), a);
        merge_locus_repeats(&mut report, "CHR1:100-101".to_string(), b);
        assert_eq!(report["CHR1:100-101"]["AT"], vec![3, 2]);
    }

    #[test]
    fn test_merge_skips_empty_allele_maps() {
        let mut report = LocusRepeatMap::default();
        merge_locus_repeats(&mut report, "CHR1:5-6".to_string(), RepeatMap::default());
        assert!(report.is_empty());
    }
}
