use crate::error::DesignError;
use rust_htslib::faidx;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashMap;

// Simple cache for FASTA file handles with random eviction
struct FaidxCache {
    capacity: usize,
    readers: HashMap<String, faidx::Reader>,
}

impl FaidxCache {
    fn new(capacity: usize) -> Self {
        FaidxCache {
            capacity,
            readers: HashMap::with_capacity(capacity),
        }
    }

    fn get_or_open(&mut self, path: &str) -> Result<&mut faidx::Reader, DesignError> {
        // Fast path: if cached, return it
        if self.readers.contains_key(path) {
            return Ok(self.readers.get_mut(path).unwrap());
        }

        // Evict one entry if at capacity
        if self.readers.len() >= self.capacity {
            if let Some(key_to_remove) = self.readers.keys().next().cloned() {
                self.readers.remove(&key_to_remove);
            }
        }

        let reader = faidx::Reader::from_path(path).map_err(|e| {
            DesignError::InvalidInput(format!("failed to open FASTA file '{path}': {e}"))
        })?;

        self.readers.insert(path.to_string(), reader);
        Ok(self.readers.get_mut(path).unwrap())
    }
}

thread_local! {
    // Per-thread cache so rayon workers never share an htslib handle
    static FAIDX_CACHE: RefCell<FaidxCache> = RefCell::new(FaidxCache::new(4));
}

/// Random-access reference sequence store backed by a `.fai`-indexed FASTA.
#[derive(Debug)]
pub struct ReferenceStore {
    path: String,
    contig_lengths: FxHashMap<String, i64>,
}

impl ReferenceStore {
    pub fn open(path: &str) -> Result<Self, DesignError> {
        // Read the .fai file for contig names and lengths; create the index
        // through rust-htslib when it does not exist yet
        let fai_path = format!("{path}.fai");
        let fai_content = match std::fs::read_to_string(&fai_path) {
            Ok(content) => content,
            Err(_) => {
                faidx::Reader::from_path(path).map_err(|e| {
                    DesignError::InvalidInput(format!(
                        "failed to create FASTA index for '{path}': {e}"
                    ))
                })?;
                std::fs::read_to_string(&fai_path).map_err(DesignError::Io)?
            }
        };

        let mut contig_lengths = FxHashMap::default();
        for line in fai_content.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() >= 2 && !fields[0].is_empty() {
                if let Ok(length) = fields[1].parse::<i64>() {
                    contig_lengths.insert(fields[0].to_string(), length);
                }
            }
        }

        if contig_lengths.is_empty() {
            return Err(DesignError::InvalidInput(format!(
                "FASTA index for '{path}' lists no sequences"
            )));
        }

        Ok(ReferenceStore {
            path: path.to_string(),
            contig_lengths,
        })
    }

    pub fn contig_length(&self, chrom: &str) -> Result<i64, DesignError> {
        self.contig_lengths.get(chrom).copied().ok_or_else(|| {
            DesignError::InvalidInput(format!("sequence '{chrom}' not found in '{}'", self.path))
        })
    }

    pub fn contig_names(&self) -> impl Iterator<Item = &str> {
        self.contig_lengths.keys().map(|s| s.as_str())
    }

    /// Fetch the uppercased subsequence `[start, end)` of `chrom`.
    pub fn fetch_sequence(&self, chrom: &str, start: i64, end: i64) -> Result<String, DesignError> {
        if start < 0 || end <= start {
            return Err(DesignError::InvalidInput(format!(
                "invalid sequence range {chrom}:{start}-{end}"
            )));
        }

        FAIDX_CACHE.with(|cache_cell| -> Result<String, DesignError> {
            let mut cache = cache_cell.borrow_mut();
            let reader = cache.get_or_open(&self.path)?;

            // fetch_seq expects a 0-based inclusive end coordinate
            let seq_vec = match reader.fetch_seq(chrom, start as usize, (end - 1) as usize) {
                Ok(seq) => {
                    let mut seq_vec = seq.to_vec();
                    // Free up the htslib buffer to avoid a leak (https://github.com/rust-bio/rust-htslib/issues/401#issuecomment-1704290171)
                    unsafe { libc::free(seq.as_ptr() as *mut std::ffi::c_void) };
                    seq_vec
                        .iter_mut()
                        .for_each(|byte| *byte = byte.to_ascii_uppercase());
                    seq_vec
                }
                Err(e) => {
                    return Err(DesignError::InvalidInput(format!(
                        "failed to fetch sequence {chrom}:{start}-{end}: {e}"
                    )))
                }
            };

            String::from_utf8(seq_vec).map_err(|_| {
                DesignError::InvalidInput(format!(
                    "sequence {chrom}:{start}-{end} is not valid UTF-8"
                ))
            })
        })
    }
}
