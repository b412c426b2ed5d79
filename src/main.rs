use clap::Parser;
use log::info;
use pcrmd::analysis::FilterCriteria;
use pcrmd::annotations::{AnnotationStore, FileKind};
use pcrmd::commands;
use pcrmd::oracle::{Primer3Exe, Primer3Params};
use pcrmd::targets::{add_regions_from_bed, parse_region_list, RegionMap};
use pcrmd::window::SizeRanges;
use rayon::ThreadPoolBuilder;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Common options shared between all commands
#[derive(Parser, Debug)]
struct CommonOpts {
    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(4).unwrap())]
    num_threads: NonZeroUsize,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

/// Amplicon and primer size limits shared by the design and scan commands.
#[derive(Parser, Debug)]
struct SizeOpts {
    /// Minimum amplicon length
    #[clap(long, value_parser, default_value_t = 200)]
    amplicon_min: i64,

    /// Maximum amplicon length
    #[clap(long, value_parser, default_value_t = 300)]
    amplicon_max: i64,

    /// Minimum primer length
    #[clap(long, value_parser, default_value_t = 18)]
    primer_min: i64,

    /// Maximum primer length
    #[clap(long, value_parser, default_value_t = 25)]
    primer_max: i64,
}

impl SizeOpts {
    fn ranges(&self) -> io::Result<SizeRanges> {
        if self.amplicon_min > self.amplicon_max || self.primer_min > self.primer_max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Size minimum exceeds maximum",
            ));
        }
        Ok(SizeRanges {
            amplicon: (self.amplicon_min, self.amplicon_max),
            primer: (self.primer_min, self.primer_max),
        })
    }
}

/// Options restricting a command to genome regions.
#[derive(Parser, Debug)]
struct RegionOpts {
    /// Regions in the format `seq_name:start-end`, comma-separated; open
    /// ends are allowed (`chr1:1000-`)
    #[clap(short = 'r', long, value_parser)]
    region: Option<String>,

    /// Path to a BED file of regions
    #[clap(long, value_parser)]
    region_bed: Option<String>,
}

impl RegionOpts {
    fn regions(&self) -> io::Result<RegionMap> {
        let mut regions = match &self.region {
            Some(spec) => parse_region_list(spec)?,
            None => RegionMap::default(),
        };
        if let Some(bed) = &self.region_bed {
            add_regions_from_bed(&mut regions, bed)?;
        }
        Ok(regions)
    }
}

/// Command-line tool for designing PCR markers around genome targets.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_subcommand = true)]
enum Args {
    /// Design primer pairs for each target
    Design {
        #[clap(flatten)]
        common: CommonOpts,

        /// Path to the indexed reference FASTA file
        #[clap(short = 'f', long, value_parser)]
        reference: String,

        /// Path to the BED file of design targets. Without one the targets
        /// are scanned from the annotation file
        #[clap(short = 'b', long, value_parser)]
        targets: Option<String>,

        /// Path to the variant annotation file whose features primers must
        /// avoid
        #[clap(short = 'a', long, value_parser)]
        annotations: Option<String>,

        /// Format of the annotation file
        #[clap(long, value_enum, default_value = "vcf")]
        annotation_format: FileKind,

        #[clap(flatten)]
        region: RegionOpts,

        #[clap(flatten)]
        sizes: SizeOpts,

        /// Path to a JSON file overriding individual primer3 settings
        #[clap(long, value_parser)]
        p3_settings: Option<String>,

        /// Name of the primer3 executable
        #[clap(long, value_parser, default_value = "primer3_core")]
        primer3: String,

        /// Run description, used as SEQUENCE_ID and in output file names
        #[clap(short = 'd', long, value_parser, default_value = "design")]
        description: String,

        /// Output directory for the amplicon and primer tables; stdout if
        /// not given
        #[clap(short = 'o', long, value_parser)]
        output_dir: Option<PathBuf>,
    },
    /// Derive candidate targets from variant annotations
    Scan {
        #[clap(flatten)]
        common: CommonOpts,

        /// Path to the variant annotation file
        #[clap(short = 'a', long, value_parser)]
        annotations: String,

        /// Format of the annotation file
        #[clap(long, value_enum, default_value = "vcf")]
        annotation_format: FileKind,

        #[clap(flatten)]
        region: RegionOpts,

        #[clap(flatten)]
        sizes: SizeOpts,

        /// Output BED file; stdout if not given
        #[clap(short = 'o', long, value_parser)]
        output: Option<PathBuf>,
    },
    /// Score targets for repeat content, diversity and call rate
    Analyze {
        #[clap(flatten)]
        common: CommonOpts,

        /// Path to the indexed reference FASTA file
        #[clap(short = 'f', long, value_parser)]
        reference: String,

        /// Path to the BED file of targets to score
        #[clap(short = 'b', long, value_parser)]
        targets: String,

        /// Path to the variant annotation file
        #[clap(short = 'a', long, value_parser)]
        annotations: String,

        /// Format of the annotation file
        #[clap(long, value_enum, default_value = "vcf")]
        annotation_format: FileKind,

        #[clap(flatten)]
        region: RegionOpts,

        /// Path to a JSON file overriding the filter criteria
        #[clap(long, value_parser)]
        criteria: Option<String>,

        /// Output CSV report
        #[clap(short = 'o', long, value_parser)]
        report: PathBuf,

        /// BED file for the targets that pass the filter
        #[clap(long, value_parser)]
        retained_bed: Option<PathBuf>,
    },
    /// Predict amplicon melting temperatures through the uMelt service
    Melt {
        #[clap(flatten)]
        common: CommonOpts,

        /// Amplicon sequences
        #[clap(value_parser)]
        sequences: Vec<String>,

        /// File with one sequence per line
        #[clap(long, value_parser)]
        sequences_file: Option<String>,
    },
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    match args {
        Args::Design {
            common,
            reference,
            targets,
            annotations,
            annotation_format,
            region,
            sizes,
            p3_settings,
            primer3,
            description,
            output_dir,
        } => {
            initialize(&common)?;
            let sizes = sizes.ranges()?;
            let regions = region.regions()?;
            let annotations = annotations
                .map(|path| AnnotationStore::open(&path, annotation_format))
                .transpose()?;
            let params = load_params(p3_settings.as_deref(), &sizes)?;
            let oracle = Primer3Exe::new(&primer3);
            commands::design::run_design(
                &reference,
                targets.as_deref(),
                annotations.as_ref(),
                if regions.is_empty() {
                    None
                } else {
                    Some(&regions)
                },
                &sizes,
                &params,
                &oracle,
                &description,
                output_dir.as_deref(),
            )?;
        }
        Args::Scan {
            common,
            annotations,
            annotation_format,
            region,
            sizes,
            output,
        } => {
            initialize(&common)?;
            let sizes = sizes.ranges()?;
            let regions = region.regions()?;
            let annotations = AnnotationStore::open(&annotations, annotation_format)?;
            commands::scan::run_scan(&annotations, &regions, &sizes, output.as_deref())?;
        }
        Args::Analyze {
            common,
            reference,
            targets,
            annotations,
            annotation_format,
            region,
            criteria,
            report,
            retained_bed,
        } => {
            initialize(&common)?;
            let regions = region.regions()?;
            let annotations = AnnotationStore::open(&annotations, annotation_format)?;
            let criteria = match criteria {
                Some(path) => FilterCriteria::from_json(&std::fs::read_to_string(path)?)?,
                None => FilterCriteria::default(),
            };
            commands::analyze::run_analyze(
                &reference,
                &targets,
                &annotations,
                if regions.is_empty() {
                    None
                } else {
                    Some(&regions)
                },
                &criteria,
                &report,
                retained_bed.as_deref(),
            )?;
        }
        Args::Melt {
            common,
            sequences,
            sequences_file,
        } => {
            initialize(&common)?;
            commands::melt::run_melt(&sequences, sequences_file.as_deref())?;
        }
    }

    Ok(())
}

/// Initialize logger and thread pool based on common options
fn initialize(common: &CommonOpts) -> io::Result<()> {
    env_logger::Builder::new()
        .filter_level(match common.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(common.num_threads.into())
        .build_global()
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to configure thread pool: {e}"),
            )
        })?;

    info!("Using {} threads", common.num_threads);
    Ok(())
}

fn load_params(settings: Option<&str>, sizes: &SizeRanges) -> io::Result<Primer3Params> {
    let mut params = match settings {
        Some(path) => Primer3Params::from_json(&std::fs::read_to_string(path)?)?,
        None => Primer3Params::default(),
    };
    params.apply_size_ranges(sizes);
    Ok(params)
}
