use std::path::PathBuf;

use clap::Parser;

/// Decode an encrypted DVR recording into a plain MPEG transport stream.
#[derive(Parser, Debug)]
#[command(name = "dvrdec", version, about)]
pub struct Args {
    /// Recording to decode.
    pub input: PathBuf,

    /// Output file; defaults to the input name with a `.ts` extension.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Media access key the recording was encrypted under.
    #[arg(short, long, env = "DVRDEC_MAK")]
    pub mak: String,

    /// Enable debug logging.
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Resolve the output path.
    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => self.input.with_extension("ts"),
        }
    }
}
