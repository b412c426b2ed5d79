use crate::error::DesignError;
use crate::window::{DesignWindow, SizeRanges, Target};
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

/// Global primer3 parameter set with the tool's stock defaults.
///
/// Deserializing a partial JSON object fills the missing fields from these
/// defaults, which is how CLI overrides are merged. Field names mirror the
/// primer3 tag names so overrides read exactly like a primer3 input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Primer3Params {
    #[serde(rename = "PRIMER_OPT_SIZE")]
    pub opt_size: u32,
    #[serde(rename = "PRIMER_PICK_INTERNAL_OLIGO")]
    pub pick_internal_oligo: u8,
    #[serde(rename = "PRIMER_INTERNAL_MAX_SELF_END")]
    pub internal_max_self_end: u32,
    #[serde(rename = "PRIMER_MIN_SIZE")]
    pub min_size: u32,
    #[serde(rename = "PRIMER_MAX_SIZE")]
    pub max_size: u32,
    #[serde(rename = "PRIMER_OPT_TM")]
    pub opt_tm: f64,
    #[serde(rename = "PRIMER_MIN_TM")]
    pub min_tm: f64,
    #[serde(rename = "PRIMER_MAX_TM")]
    pub max_tm: f64,
    #[serde(rename = "PRIMER_MIN_GC")]
    pub min_gc: f64,
    #[serde(rename = "PRIMER_MAX_GC")]
    pub max_gc: f64,
    #[serde(rename = "PRIMER_MAX_POLY_X")]
    pub max_poly_x: u32,
    #[serde(rename = "PRIMER_INTERNAL_MAX_POLY_X")]
    pub internal_max_poly_x: u32,
    #[serde(rename = "PRIMER_SALT_MONOVALENT")]
    pub salt_monovalent: f64,
    #[serde(rename = "PRIMER_DNA_CONC")]
    pub dna_conc: f64,
    #[serde(rename = "PRIMER_MAX_NS_ACCEPTED")]
    pub max_ns_accepted: u32,
    #[serde(rename = "PRIMER_MAX_SELF_ANY")]
    pub max_self_any: u32,
    #[serde(rename = "PRIMER_MAX_SELF_END")]
    pub max_self_end: u32,
    #[serde(rename = "PRIMER_PAIR_MAX_COMPL_ANY")]
    pub pair_max_compl_any: u32,
    #[serde(rename = "PRIMER_PAIR_MAX_COMPL_END")]
    pub pair_max_compl_end: u32,
    #[serde(rename = "PRIMER_PRODUCT_SIZE_RANGE")]
    pub product_size_range: (i64, i64),
    #[serde(rename = "PRIMER_NUM_RETURN")]
    pub num_return: u32,
    /// Any other PRIMER_* settings from the override file, forwarded to the
    /// oracle verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Primer3Params {
    fn default() -> Self {
        Primer3Params {
            opt_size: 20,
            pick_internal_oligo: 0,
            internal_max_self_end: 8,
            min_size: 18,
            max_size: 25,
            opt_tm: 60.0,
            min_tm: 55.0,
            max_tm: 63.0,
            min_gc: 20.0,
            max_gc: 80.0,
            max_poly_x: 100,
            internal_max_poly_x: 100,
            salt_monovalent: 50.0,
            dna_conc: 50.0,
            max_ns_accepted: 0,
            max_self_any: 12,
            max_self_end: 8,
            pair_max_compl_any: 12,
            pair_max_compl_end: 8,
            product_size_range: (200, 300),
            num_return: 2,
            extra: BTreeMap::new(),
        }
    }
}

impl Primer3Params {
    /// Parse a JSON override blob on top of the defaults. Keys without a
    /// dedicated field are kept and forwarded to the oracle, as long as they
    /// look like primer3 global tags.
    pub fn from_json(json: &str) -> Result<Self, DesignError> {
        let params: Primer3Params = serde_json::from_str(json).map_err(|e| {
            DesignError::InvalidInput(format!("invalid primer3 parameter overrides: {e}"))
        })?;
        if let Some(key) = params.extra.keys().find(|k| !k.starts_with("PRIMER_")) {
            return Err(DesignError::InvalidInput(format!(
                "unknown primer3 setting '{key}'"
            )));
        }
        Ok(params)
    }

    /// Keep the primer and product limits in step with the size ranges used
    /// for windowing.
    pub fn apply_size_ranges(&mut self, sizes: &SizeRanges) {
        self.min_size = sizes.primer.0 as u32;
        self.max_size = sizes.primer.1 as u32;
        self.product_size_range = sizes.amplicon;
    }

    fn boulder_tags(&self) -> Vec<(String, String)> {
        let mut tags = vec![
            ("PRIMER_OPT_SIZE".into(), self.opt_size.to_string()),
            (
                "PRIMER_PICK_INTERNAL_OLIGO".into(),
                self.pick_internal_oligo.to_string(),
            ),
            (
                "PRIMER_INTERNAL_MAX_SELF_END".into(),
                self.internal_max_self_end.to_string(),
            ),
            ("PRIMER_MIN_SIZE".into(), self.min_size.to_string()),
            ("PRIMER_MAX_SIZE".into(), self.max_size.to_string()),
            ("PRIMER_OPT_TM".into(), format_float(self.opt_tm)),
            ("PRIMER_MIN_TM".into(), format_float(self.min_tm)),
            ("PRIMER_MAX_TM".into(), format_float(self.max_tm)),
            ("PRIMER_MIN_GC".into(), format_float(self.min_gc)),
            ("PRIMER_MAX_GC".into(), format_float(self.max_gc)),
            ("PRIMER_MAX_POLY_X".into(), self.max_poly_x.to_string()),
            (
                "PRIMER_INTERNAL_MAX_POLY_X".into(),
                self.internal_max_poly_x.to_string(),
            ),
            (
                "PRIMER_SALT_MONOVALENT".into(),
                format_float(self.salt_monovalent),
            ),
            ("PRIMER_DNA_CONC".into(), format_float(self.dna_conc)),
            (
                "PRIMER_MAX_NS_ACCEPTED".into(),
                self.max_ns_accepted.to_string(),
            ),
            ("PRIMER_MAX_SELF_ANY".into(), self.max_self_any.to_string()),
            ("PRIMER_MAX_SELF_END".into(), self.max_self_end.to_string()),
            (
                "PRIMER_PAIR_MAX_COMPL_ANY".into(),
                self.pair_max_compl_any.to_string(),
            ),
            (
                "PRIMER_PAIR_MAX_COMPL_END".into(),
                self.pair_max_compl_end.to_string(),
            ),
            (
                "PRIMER_PRODUCT_SIZE_RANGE".into(),
                format!(
                    "{}-{}",
                    self.product_size_range.0, self.product_size_range.1
                ),
            ),
            ("PRIMER_NUM_RETURN".into(), self.num_return.to_string()),
        ];
        for (tag, value) in &self.extra {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tags.push((tag.clone(), rendered));
        }
        tags.shrink_to_fit();
        tags
    }
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// One oracle invocation: a window-local design problem.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignTask {
    pub sequence_id: String,
    pub target_id: String,
    pub chrom: String,
    pub ref_offset: i64,
    pub template: String,
    /// (local start, length)
    pub target: (i64, i64),
    pub excluded_regions: Vec<(i64, i64)>,
}

impl DesignTask {
    pub fn from_window(window: &DesignWindow, target: &Target, description: &str) -> Self {
        DesignTask {
            sequence_id: description.to_string(),
            target_id: target.to_string(),
            chrom: window.chrom.clone(),
            ref_offset: window.offset,
            template: String::new(),
            target: window.local_target,
            excluded_regions: window.excluded_regions.clone(),
        }
    }

    /// Render the task plus globals as a Boulder-IO record.
    pub fn to_boulder(&self, params: &Primer3Params) -> String {
        let mut record = String::new();
        record.push_str(&format!("SEQUENCE_ID={}\n", self.sequence_id));
        record.push_str(&format!("SEQUENCE_TEMPLATE={}\n", self.template));
        record.push_str(&format!(
            "SEQUENCE_TARGET={},{}\n",
            self.target.0, self.target.1
        ));
        if !self.excluded_regions.is_empty() {
            let regions: Vec<String> = self
                .excluded_regions
                .iter()
                .map(|(start, len)| format!("{start},{len}"))
                .collect();
            record.push_str(&format!(
                "SEQUENCE_EXCLUDED_REGION={}\n",
                regions.join(" ")
            ));
        }
        for (tag, value) in params.boulder_tags() {
            record.push_str(&format!("{tag}={value}\n"));
        }
        record.push_str("=\n");
        record
    }
}

/// Flat tag/value mapping as returned by the oracle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleOutput {
    fields: FxHashMap<String, String>,
}

/// One primer site decoded from the oracle output (window-local position).
///
/// `position` is the 5' base for left primers but the 3' (highest) base for
/// right primers, exactly as the oracle reports it. Quality figures are kept
/// as the oracle's own strings so the output tables reproduce them verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimerSite {
    pub position: i64,
    pub length: i64,
    pub sequence: String,
    pub tm: String,
    pub gc_percent: String,
    pub penalty: String,
}

/// One candidate primer pair, rebuilt from the oracle's index-suffixed tags.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub index: usize,
    pub left: PrimerSite,
    pub right: PrimerSite,
    pub internal: Option<PrimerSite>,
    pub pair_penalty: String,
    pub pair_compl_any: String,
    pub pair_compl_end: String,
    pub product_size: String,
}

impl CandidatePair {
    /// 1-based inclusive genome-space display region spanning the pair, in
    /// the genome-browser convention (the +1 shift is deliberate).
    pub fn amplicon_region(&self, chrom: &str, offset: i64) -> String {
        format!(
            "{}:{}-{}",
            chrom,
            self.left.position + offset + 1,
            self.right.position + offset + 1
        )
    }
}

impl OracleOutput {
    pub fn from_fields(fields: FxHashMap<String, String>) -> Self {
        OracleOutput { fields }
    }

    /// Parse a Boulder-IO record (`KEY=VALUE` lines up to a lone `=`).
    pub fn parse_boulder(text: &str) -> Result<Self, DesignError> {
        let mut fields = FxHashMap::default();
        for line in text.lines() {
            let line = line.trim_end();
            if line == "=" {
                break;
            }
            if line.is_empty() {
                continue;
            }
            let Some((tag, value)) = line.split_once('=') else {
                return Err(DesignError::OracleFailure(format!(
                    "unparseable oracle output line: '{line}'"
                )));
            };
            fields.insert(tag.to_string(), value.to_string());
        }
        Ok(OracleOutput { fields })
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.fields.get(tag).map(|s| s.as_str())
    }

    pub fn num_returned(&self) -> usize {
        self.get("PRIMER_PAIR_NUM_RETURNED")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn required(&self, tag: &str) -> Result<&str, DesignError> {
        self.get(tag)
            .ok_or_else(|| DesignError::OracleFailure(format!("oracle output missing tag {tag}")))
    }

    fn position_pair(&self, tag: &str) -> Result<(i64, i64), DesignError> {
        let value = self.required(tag)?;
        let parsed = value.split_once(',').and_then(|(pos, len)| {
            Some((pos.trim().parse().ok()?, len.trim().parse().ok()?))
        });
        parsed.ok_or_else(|| {
            DesignError::OracleFailure(format!("malformed position tag {tag}={value}"))
        })
    }

    fn site(&self, side: &str, index: usize) -> Result<PrimerSite, DesignError> {
        let (position, length) = self.position_pair(&format!("PRIMER_{side}_{index}"))?;
        let field = |suffix: &str| {
            self.get(&format!("PRIMER_{side}_{index}_{suffix}"))
                .unwrap_or_default()
                .to_string()
        };
        Ok(PrimerSite {
            position,
            length,
            sequence: field("SEQUENCE"),
            tm: field("TM"),
            gc_percent: field("GC_PERCENT"),
            penalty: field("PENALTY"),
        })
    }

    /// Rebuild the candidate list from the known tag templates.
    ///
    /// Candidates are addressed by exact `PRIMER_<SIDE>_<i>...` tag names,
    /// never by scanning tag names for an index substring.
    pub fn candidates(&self) -> Result<Vec<CandidatePair>, DesignError> {
        let mut pairs = Vec::with_capacity(self.num_returned());
        for index in 0..self.num_returned() {
            let internal = if self
                .get(&format!("PRIMER_INTERNAL_{index}"))
                .is_some()
            {
                Some(self.site("INTERNAL", index)?)
            } else {
                None
            };
            let pair_field = |suffix: &str| {
                self.get(&format!("PRIMER_PAIR_{index}_{suffix}"))
                    .unwrap_or_default()
                    .to_string()
            };
            pairs.push(CandidatePair {
                index,
                left: self.site("LEFT", index)?,
                right: self.site("RIGHT", index)?,
                internal,
                pair_penalty: pair_field("PENALTY"),
                pair_compl_any: pair_field("COMPL_ANY"),
                pair_compl_end: pair_field("COMPL_END"),
                product_size: pair_field("PRODUCT_SIZE"),
            });
        }
        Ok(pairs)
    }
}

/// The decoded outcome of one oracle call, tagged with everything needed to
/// map candidates back to genome space.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetReport {
    pub sequence_id: String,
    pub target_id: String,
    pub chrom: String,
    pub ref_offset: i64,
    pub candidates: Vec<CandidatePair>,
}

/// Seam to the external primer-design engine.
pub trait PrimerOracle {
    fn design(
        &self,
        task: &DesignTask,
        params: &Primer3Params,
    ) -> Result<OracleOutput, DesignError>;
}

/// Production oracle: the `primer3_core` executable, spoken to over
/// Boulder-IO on stdin/stdout.
pub struct Primer3Exe {
    executable: String,
}

impl Primer3Exe {
    pub fn new(executable: &str) -> Self {
        Primer3Exe {
            executable: executable.to_string(),
        }
    }
}

impl Default for Primer3Exe {
    fn default() -> Self {
        Primer3Exe::new("primer3_core")
    }
}

impl PrimerOracle for Primer3Exe {
    fn design(
        &self,
        task: &DesignTask,
        params: &Primer3Params,
    ) -> Result<OracleOutput, DesignError> {
        let record = task.to_boulder(params);
        debug!("Invoking {} for {}", self.executable, task.target_id);

        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                DesignError::OracleFailure(format!("failed to spawn '{}': {e}", self.executable))
            })?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(record.as_bytes())
            .map_err(|e| DesignError::OracleFailure(format!("failed to write oracle input: {e}")))?;

        let output = child
            .wait_with_output()
            .map_err(|e| DesignError::OracleFailure(format!("oracle did not terminate: {e}")))?;

        if !output.status.success() {
            return Err(DesignError::OracleFailure(format!(
                "'{}' exited with {}: {}",
                self.executable,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let decoded = OracleOutput::parse_boulder(&String::from_utf8_lossy(&output.stdout))?;
        if let Some(error) = decoded.get("PRIMER_ERROR") {
            return Err(DesignError::OracleFailure(error.to_string()));
        }
        Ok(decoded)
    }
}

/// Run the oracle once for `window` and decode the answer.
///
/// No retry and no validation of the oracle's own checks; any failure
/// propagates unmodified.
pub fn call_oracle<O: PrimerOracle>(
    oracle: &O,
    window: &DesignWindow,
    target: &Target,
    template: String,
    description: &str,
    params: &Primer3Params,
) -> Result<TargetReport, DesignError> {
    let mut task = DesignTask::from_window(window, target, description);
    task.template = template;

    let output = oracle.design(&task, params)?;
    let candidates = output.candidates()?;

    Ok(TargetReport {
        sequence_id: task.sequence_id,
        target_id: task.target_id,
        chrom: task.chrom,
        ref_offset: task.ref_offset,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> OracleOutput {
        let text = "\
PRIMER_PAIR_NUM_RETURNED=2
PRIMER_LEFT_NUM_RETURNED=2
PRIMER_LEFT_0=10,20
PRIMER_LEFT_0_SEQUENCE=ACGTACGTACGTACGTACGT
PRIMER_LEFT_0_TM=59.96
PRIMER_LEFT_0_GC_PERCENT=50.0
PRIMER_LEFT_0_PENALTY=0.04
PRIMER_RIGHT_0=249,20
PRIMER_RIGHT_0_SEQUENCE=TGCATGCATGCATGCATGCA
PRIMER_RIGHT_0_TM=60.11
PRIMER_RIGHT_0_GC_PERCENT=50.0
PRIMER_RIGHT_0_PENALTY=0.11
PRIMER_PAIR_0_PENALTY=0.15
PRIMER_PAIR_0_COMPL_ANY=3.0
PRIMER_PAIR_0_COMPL_END=1.0
PRIMER_PAIR_0_PRODUCT_SIZE=240
PRIMER_LEFT_1=12,19
PRIMER_LEFT_1_SEQUENCE=GTACGTACGTACGTACGTA
PRIMER_RIGHT_1=244,18
PRIMER_RIGHT_1_SEQUENCE=GCATGCATGCATGCATGC
PRIMER_PAIR_1_PENALTY=0.52
PRIMER_PAIR_1_PRODUCT_SIZE=233
=
";
        OracleOutput::parse_boulder(text).unwrap()
    }

    #[test]
    fn test_boulder_record_layout() {
        let task = DesignTask {
            sequence_id: "run1".to_string(),
            target_id: "CHR1:5000-5001".to_string(),
            chrom: "CHR1".to_string(),
            ref_offset: 4719,
            template: "ACGT".to_string(),
            target: (281, 1),
            excluded_regions: vec![(10, 5), (40, 3)],
        };
        let record = task.to_boulder(&Primer3Params::default());

        assert!(record.starts_with("SEQUENCE_ID=run1\n"));
        assert!(record.contains("SEQUENCE_TEMPLATE=ACGT\n"));
        assert!(record.contains("SEQUENCE_TARGET=281,1\n"));
        assert!(record.contains("SEQUENCE_EXCLUDED_REGION=10,5 40,3\n"));
        assert!(record.contains("PRIMER_PRODUCT_SIZE_RANGE=200-300\n"));
        assert!(record.contains("PRIMER_OPT_TM=60.0\n"));
        assert!(record.ends_with("=\n"));
    }

    #[test]
    fn test_excluded_region_tag_omitted_when_empty() {
        let task = DesignTask {
            sequence_id: "run1".to_string(),
            target_id: "CHR1:10-11".to_string(),
            chrom: "CHR1".to_string(),
            ref_offset: 0,
            template: "ACGT".to_string(),
            target: (10, 1),
            excluded_regions: Vec::new(),
        };
        let record = task.to_boulder(&Primer3Params::default());
        assert!(!record.contains("SEQUENCE_EXCLUDED_REGION"));
    }

    #[test]
    fn test_param_overrides_merge_with_defaults() {
        let params =
            Primer3Params::from_json(r#"{"PRIMER_OPT_TM": 58.5, "PRIMER_NUM_RETURN": 5}"#)
                .unwrap();
        assert_eq!(params.opt_tm, 58.5);
        assert_eq!(params.num_return, 5);
        // Untouched fields keep their defaults
        assert_eq!(params.min_size, 18);
        assert_eq!(params.product_size_range, (200, 300));
    }

    #[test]
    fn test_unlisted_primer_settings_reach_the_oracle() {
        let params = Primer3Params::from_json(
            r#"{"PRIMER_GC_CLAMP": 2, "PRIMER_THERMODYNAMIC_PARAMETERS_PATH": "/opt/p3"}"#,
        )
        .unwrap();
        let task = DesignTask {
            sequence_id: "design".into(),
            target_id: "CHR1:10-11".into(),
            chrom: "CHR1".into(),
            ref_offset: 0,
            template: "ACGT".into(),
            target: (1, 1),
            excluded_regions: vec![],
        };
        let record = task.to_boulder(&params);
        assert!(record.contains("PRIMER_GC_CLAMP=2\n"));
        assert!(record.contains("PRIMER_THERMODYNAMIC_PARAMETERS_PATH=/opt/p3\n"));
    }

    #[test]
    fn test_non_primer_settings_are_rejected() {
        let err = Primer3Params::from_json(r#"{"SEQUENCE_TEMPLATE": "ACGT"}"#).unwrap_err();
        assert!(err.to_string().contains("SEQUENCE_TEMPLATE"));
    }

    #[test]
    fn test_apply_size_ranges() {
        let mut params = Primer3Params::default();
        params.apply_size_ranges(&SizeRanges {
            amplicon: (100, 500),
            primer: (20, 28),
        });
        assert_eq!(params.min_size, 20);
        assert_eq!(params.max_size, 28);
        assert_eq!(params.product_size_range, (100, 500));
    }

    #[test]
    fn test_structured_decode() {
        let output = sample_output();
        assert_eq!(output.num_returned(), 2);

        let candidates = output.candidates().unwrap();
        assert_eq!(candidates.len(), 2);

        let first = &candidates[0];
        assert_eq!(first.left.position, 10);
        assert_eq!(first.left.length, 20);
        assert_eq!(first.left.sequence, "ACGTACGTACGTACGTACGT");
        assert_eq!(first.right.position, 249);
        assert_eq!(first.right.tm, "60.11");
        assert_eq!(first.pair_penalty, "0.15");
        assert_eq!(first.product_size, "240");
        assert!(first.internal.is_none());

        // Missing optional per-site tags decode as empty strings
        assert_eq!(candidates[1].left.tm, "");
    }

    #[test]
    fn test_decode_ignores_index_substring_traps() {
        // A tag with a digit in an unrelated place must not leak into a
        // candidate's fields
        let mut fields = FxHashMap::default();
        fields.insert("PRIMER_PAIR_NUM_RETURNED".to_string(), "1".to_string());
        fields.insert("PRIMER_LEFT_0".to_string(), "5,18".to_string());
        fields.insert("PRIMER_RIGHT_0".to_string(), "90,18".to_string());
        fields.insert("PRIMER_LEFT_EXPLAIN".to_string(), "considered 10".to_string());
        let output = OracleOutput::from_fields(fields);
        let candidates = output.candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].left.sequence, "");
    }

    #[test]
    fn test_amplicon_region_display_convention() {
        let output = sample_output();
        let candidate = &output.candidates().unwrap()[0];
        // 1-based inclusive: both endpoints shifted by +1
        assert_eq!(
            candidate.amplicon_region("CHR1", 4719),
            "CHR1:4730-4969"
        );
    }

    #[test]
    fn test_oracle_error_tag() {
        let output =
            OracleOutput::parse_boulder("PRIMER_ERROR=SEQUENCE_TARGET out of range\n=\n").unwrap();
        assert_eq!(
            output.get("PRIMER_ERROR"),
            Some("SEQUENCE_TARGET out of range")
        );
    }
}
