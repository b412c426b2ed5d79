use crate::error::DesignError;
use crate::melt::{MeltClient, MeltRequest};
use log::info;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

/// The `melt` subcommand: predict the melting temperature of one or more
/// amplicon sequences through the uMelt service.
///
/// Sequences come either directly from the command line or one per line
/// from a file. Output is `sequence<TAB>tm` on stdout.
pub fn run_melt(sequences: &[String], sequences_file: Option<&str>) -> io::Result<()> {
    let mut inputs: Vec<String> = sequences.to_vec();
    if let Some(path) = sequences_file {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                inputs.push(trimmed.to_string());
            }
        }
    }
    if inputs.is_empty() {
        return Err(DesignError::InvalidInput(
            "no sequences given; pass sequences or --sequences-file".to_string(),
        )
        .into());
    }

    let client = MeltClient::default();
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for sequence in &inputs {
        info!("Predicting melting temperature for {} bp", sequence.len());
        let curve = client.fetch_helicity(&MeltRequest::new(sequence))?;
        writeln!(handle, "{}\t{:.2}", sequence, curve.melting_temp())?;
    }
    Ok(())
}
