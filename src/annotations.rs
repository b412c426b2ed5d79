use crate::error::DesignError;
use coitrees::{BasicCOITree, Interval, IntervalTree};
use log::debug;
use noodles::bgzf;
use rust_htslib::bcf::record::GenotypeAllele;
use rust_htslib::bcf::{self, Read as BcfRead};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

/// One annotated feature: a variant record or a plain interval.
///
/// `call_rate` and `nucl_diversity` are populated only by variant-backed
/// stores; interval stores leave them unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub chrom: String,
    pub start: i64,
    pub stop: i64,
    pub alt_alleles: Vec<String>,
    pub call_rate: Option<f64>,
    pub nucl_diversity: Option<f64>,
}

impl Feature {
    pub fn interval(chrom: &str, start: i64, stop: i64) -> Self {
        Feature {
            chrom: chrom.to_string(),
            start,
            stop,
            alt_alleles: Vec::new(),
            call_rate: None,
            nucl_diversity: None,
        }
    }

    /// Coordinates must be sane before they enter exclusion-region
    /// arithmetic; a negative-length feature is a data error.
    pub fn validate(&self) -> Result<(), DesignError> {
        if self.stop < self.start {
            return Err(DesignError::MalformedFeature {
                chrom: self.chrom.clone(),
                start: self.start,
                stop: self.stop,
            });
        }
        Ok(())
    }

    /// Locus key used by the per-locus SSR report.
    pub fn locus_key(&self) -> String {
        format!("{}:{}-{}", self.chrom, self.start, self.stop)
    }
}

/// Declared kind of an annotation file. The caller states what the file is;
/// nothing is inferred from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FileKind {
    Vcf,
    Bed,
}

/// Annotation source dispatching range queries to the matching backend.
pub enum AnnotationStore {
    Vcf(VcfStore),
    Bed(BedStore),
}

impl AnnotationStore {
    pub fn open(path: &str, kind: FileKind) -> Result<Self, DesignError> {
        match kind {
            FileKind::Vcf => Ok(AnnotationStore::Vcf(VcfStore::open(path)?)),
            FileKind::Bed => Ok(AnnotationStore::Bed(BedStore::open(path)?)),
        }
    }

    /// All features overlapping `[start, stop)` on `chrom`.
    pub fn fetch(&self, chrom: &str, start: i64, stop: i64) -> Result<Vec<Feature>, DesignError> {
        match self {
            AnnotationStore::Vcf(store) => store.fetch(chrom, start, stop),
            AnnotationStore::Bed(store) => Ok(store.fetch(chrom, start, stop)),
        }
    }

    /// Every feature in the store, in file order.
    pub fn fetch_all(&self) -> Result<Vec<Feature>, DesignError> {
        match self {
            AnnotationStore::Vcf(store) => store.fetch_all(),
            AnnotationStore::Bed(store) => Ok(store.features.clone()),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            AnnotationStore::Vcf(_) => FileKind::Vcf,
            AnnotationStore::Bed(_) => FileKind::Bed,
        }
    }
}

// Per-thread cache of open VCF readers so parallel workers never share a
// reader mid-fetch
struct BcfReaderCache {
    capacity: usize,
    readers: HashMap<String, bcf::IndexedReader>,
}

impl BcfReaderCache {
    fn new(capacity: usize) -> Self {
        BcfReaderCache {
            capacity,
            readers: HashMap::with_capacity(capacity),
        }
    }

    fn get_or_open(&mut self, path: &str) -> Result<&mut bcf::IndexedReader, DesignError> {
        if self.readers.contains_key(path) {
            return Ok(self.readers.get_mut(path).unwrap());
        }

        if self.readers.len() >= self.capacity {
            if let Some(key_to_remove) = self.readers.keys().next().cloned() {
                self.readers.remove(&key_to_remove);
            }
        }

        let reader = bcf::IndexedReader::from_path(path).map_err(|e| {
            DesignError::InvalidInput(format!("failed to open VCF file '{path}': {e}"))
        })?;
        self.readers.insert(path.to_string(), reader);
        Ok(self.readers.get_mut(path).unwrap())
    }
}

thread_local! {
    static BCF_CACHE: RefCell<BcfReaderCache> = RefCell::new(BcfReaderCache::new(4));
}

/// Indexed VCF/BCF variant store.
pub struct VcfStore {
    path: String,
}

impl VcfStore {
    pub fn open(path: &str) -> Result<Self, DesignError> {
        // Open once eagerly so a bad path or missing index fails at startup
        bcf::IndexedReader::from_path(path).map_err(|e| {
            DesignError::InvalidInput(format!("failed to open VCF file '{path}': {e}"))
        })?;
        Ok(VcfStore {
            path: path.to_string(),
        })
    }

    pub fn fetch(&self, chrom: &str, start: i64, stop: i64) -> Result<Vec<Feature>, DesignError> {
        BCF_CACHE.with(|cache_cell| {
            let mut cache = cache_cell.borrow_mut();
            let reader = cache.get_or_open(&self.path)?;

            let rid = reader.header().name2rid(chrom.as_bytes()).map_err(|e| {
                DesignError::InvalidInput(format!(
                    "chromosome '{chrom}' not found in '{}': {e}",
                    self.path
                ))
            })?;
            reader
                .fetch(rid, start.max(0) as u64, Some(stop.max(0) as u64))
                .map_err(|e| {
                    DesignError::InvalidInput(format!(
                        "VCF fetch {chrom}:{start}-{stop} failed: {e}"
                    ))
                })?;

            let mut features = Vec::new();
            let mut record = reader.empty_record();
            while let Some(result) = reader.read(&mut record) {
                result.map_err(|e| {
                    DesignError::InvalidInput(format!("failed to read VCF record: {e}"))
                })?;
                features.push(feature_from_record(chrom, &record));
            }
            debug!(
                "Fetched {} variant records for {}:{}-{}",
                features.len(),
                chrom,
                start,
                stop
            );
            Ok(features)
        })
    }

    pub fn fetch_all(&self) -> Result<Vec<Feature>, DesignError> {
        let mut reader = bcf::Reader::from_path(&self.path).map_err(|e| {
            DesignError::InvalidInput(format!("failed to open VCF file '{}': {e}", self.path))
        })?;
        let header = reader.header().clone();
        let mut features = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| {
                DesignError::InvalidInput(format!("failed to read VCF record: {e}"))
            })?;
            let chrom = record
                .rid()
                .and_then(|rid| header.rid2name(rid).ok())
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_default();
            features.push(feature_from_record(&chrom, &record));
        }
        Ok(features)
    }
}

fn feature_from_record(chrom: &str, record: &bcf::Record) -> Feature {
    let alleles = record.alleles();
    let alt_alleles: Vec<String> = alleles
        .iter()
        .skip(1)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();

    let (call_rate, nucl_diversity) = genotype_stats(record, alt_alleles.len());

    Feature {
        chrom: chrom.to_string(),
        start: record.pos(),
        stop: record.end(),
        alt_alleles,
        call_rate,
        nucl_diversity,
    }
}

/// Call rate = fraction of samples with a fully called genotype.
/// Nucleotide diversity follows the per-site estimator
/// `n/(n-1) * 2pq` over `n` called chromosomes, defined for biallelic
/// sites only.
fn genotype_stats(record: &bcf::Record, n_alts: usize) -> (Option<f64>, Option<f64>) {
    let sample_count = record.sample_count() as usize;
    if sample_count == 0 {
        return (None, None);
    }
    let genotypes = match record.genotypes() {
        Ok(genotypes) => genotypes,
        Err(_) => return (None, None),
    };

    let mut called_samples = 0usize;
    let mut called_chroms = 0usize;
    let mut alt_chroms = 0usize;
    for sample in 0..sample_count {
        let genotype = genotypes.get(sample);
        let mut sample_called = !genotype.is_empty();
        for allele in genotype.iter() {
            match allele {
                GenotypeAllele::Unphased(idx) | GenotypeAllele::Phased(idx) => {
                    called_chroms += 1;
                    if *idx > 0 {
                        alt_chroms += 1;
                    }
                }
                GenotypeAllele::UnphasedMissing | GenotypeAllele::PhasedMissing => {
                    sample_called = false;
                }
            }
        }
        if sample_called {
            called_samples += 1;
        }
    }

    let call_rate = Some(called_samples as f64 / sample_count as f64);

    if n_alts != 1 || called_chroms < 2 {
        return (call_rate, None);
    }
    let n = called_chroms as f64;
    let p = alt_chroms as f64 / n;
    let q = 1.0 - p;
    (call_rate, Some(n / (n - 1.0) * 2.0 * p * q))
}

/// In-memory BED store with per-chromosome interval trees.
pub struct BedStore {
    features: Vec<Feature>,
    trees: FxHashMap<String, BasicCOITree<usize, u32>>,
}

impl std::fmt::Debug for BedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedStore")
            .field("features", &self.features)
            .field("trees", &self.trees.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BedStore {
    pub fn open(path: &str) -> Result<Self, DesignError> {
        let file = File::open(path).map_err(|e| {
            DesignError::InvalidInput(format!("failed to open BED file '{path}': {e}"))
        })?;
        let reader: Box<dyn io::Read> = if [".gz", ".bgz"].iter().any(|e| path.ends_with(e)) {
            Box::new(bgzf::io::Reader::new(file))
        } else {
            Box::new(file)
        };
        Self::from_reader(BufReader::new(reader), path)
    }

    fn from_reader<R: BufRead>(reader: R, path: &str) -> Result<Self, DesignError> {
        let mut features = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("track") {
                continue;
            }
            let fields: Vec<&str> = trimmed.split('\t').collect();
            if fields.len() < 3 {
                return Err(DesignError::InvalidInput(format!(
                    "invalid BED line {} in '{path}': expected at least 3 fields",
                    line_num + 1
                )));
            }
            let start = fields[1].parse::<i64>().map_err(|_| {
                DesignError::InvalidInput(format!(
                    "invalid BED start on line {} in '{path}'",
                    line_num + 1
                ))
            })?;
            let stop = fields[2].parse::<i64>().map_err(|_| {
                DesignError::InvalidInput(format!(
                    "invalid BED end on line {} in '{path}'",
                    line_num + 1
                ))
            })?;
            let feature = Feature::interval(fields[0], start, stop);
            feature.validate()?;
            features.push(feature);
        }

        let mut by_chrom: FxHashMap<String, Vec<Interval<usize>>> = FxHashMap::default();
        for (idx, feature) in features.iter().enumerate() {
            // coitrees overlap tests are inclusive on both ends, so store
            // half-open intervals with last = stop - 1
            by_chrom
                .entry(feature.chrom.clone())
                .or_default()
                .push(Interval {
                    first: feature.start as i32,
                    last: (feature.stop - 1) as i32,
                    metadata: idx,
                });
        }
        let trees = by_chrom
            .into_iter()
            .map(|(chrom, intervals)| (chrom, BasicCOITree::new(intervals.as_slice())))
            .collect();

        Ok(BedStore { features, trees })
    }

    pub fn fetch(&self, chrom: &str, start: i64, stop: i64) -> Vec<Feature> {
        let mut hits: Vec<usize> = Vec::new();
        if let Some(tree) = self.trees.get(chrom) {
            tree.query(start as i32, (stop - 1) as i32, |interval| {
                hits.push(interval.metadata);
            });
        }
        hits.sort_unstable();
        hits.into_iter()
            .map(|idx| self.features[idx].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store_from(text: &str) -> BedStore {
        BedStore::from_reader(Cursor::new(text.to_string()), "test.bed").unwrap()
    }

    #[test]
    fn test_bed_overlap_query() {
        let store = store_from("chr1\t100\t200\nchr1\t500\t600\nchr2\t100\t200\n");
        let hits = store.fetch("chr1", 150, 550);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start, 100);
        assert_eq!(hits[1].start, 500);

        // Half-open semantics: [200, 500) touches neither feature
        assert!(store.fetch("chr1", 200, 500).is_empty());
        assert!(store.fetch("chr3", 0, 1000).is_empty());
    }

    #[test]
    fn test_bed_rejects_malformed_feature() {
        let err = BedStore::from_reader(Cursor::new("chr1\t300\t200\n".to_string()), "bad.bed")
            .unwrap_err();
        assert!(matches!(err, DesignError::MalformedFeature { .. }));
    }

    #[test]
    fn test_bed_skips_comments_and_track_lines() {
        let store = store_from("# header\ntrack name=test\nchr1\t10\t20\n");
        assert_eq!(store.fetch("chr1", 0, 100).len(), 1);
    }

    #[test]
    fn test_locus_key_format() {
        let feature = Feature::interval("CHR1", 100, 101);
        assert_eq!(feature.locus_key(), "CHR1:100-101");
    }
}
