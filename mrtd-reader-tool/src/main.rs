mod pcsc_transport;


use std::ffi::CString;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser};
use mrtd_reader::mrz::BacSeed;
use mrtd_reader::scan::{ScanError, ScanOptions, ScanProgress, Scanner};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::pcsc_transport::PcscTransport;


#[derive(Clone, Debug, Parser, PartialEq)]
enum Mode {
    /// Lists the PC/SC readers attached to this machine.
    ListReaders,

    /// Reads the personal data and portrait from a travel document.
    Scan(ScanOpts),
}

#[derive(Clone, Debug, Parser, PartialEq)]
struct ScanOpts {
    #[arg(short, long = "reader", default_value = "0")]
    pub reader_index: usize,

    #[command(flatten)]
    pub seed: SeedOpts,

    /// Quality (0.0 to 1.0) with which the portrait is meant to be re-encoded.
    #[arg(short, long, default_value = "1.0")]
    pub quality: f32,

    /// Where to store the portrait exactly as delivered by the chip.
    #[arg(short, long = "photo-out")]
    pub photo_out: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Clone, Debug, PartialEq)]
#[group(required = true, multiple = true)]
struct SeedOpts {
    /// File containing the full MRZ text.
    #[arg(short, long = "mrz", conflicts_with_all = ["document_number", "date_of_birth", "date_of_expiry"])]
    pub mrz_path: Option<PathBuf>,

    #[arg(long, requires = "date_of_birth", requires = "date_of_expiry")]
    pub document_number: Option<String>,

    /// YYMMDD
    #[arg(long, requires = "document_number")]
    pub date_of_birth: Option<String>,

    /// YYMMDD
    #[arg(long, requires = "document_number")]
    pub date_of_expiry: Option<String>,
}


#[derive(Debug)]
enum ToolError {
    Pcsc(pcsc::Error),
    NoSuchReader { index: usize },
    MrzFile(PathBuf, std::io::Error),
    Seed(mrtd_reader::mrz::Error),
    MissingSeed,
    Scan(ScanError),
    PhotoOut(PathBuf, std::io::Error),
}
impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcsc(e)
                => write!(f, "PC/SC error: {}", e),
            Self::NoSuchReader { index }
                => write!(f, "no reader at index {}", index),
            Self::MrzFile(path, e)
                => write!(f, "failed to read MRZ from {}: {}", path.display(), e),
            Self::Seed(e)
                => write!(f, "invalid access data: {}", e),
            Self::MissingSeed
                => write!(f, "either --mrz or the document number and both dates are required"),
            Self::Scan(e) if e.is_disconnect()
                => write!(f, "lost connection to the chip; present the document again"),
            Self::Scan(e)
                => write!(f, "scan failed: {}", e),
            Self::PhotoOut(path, e)
                => write!(f, "failed to write portrait to {}: {}", path.display(), e),
        }
    }
}
impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pcsc(e) => Some(e),
            Self::MrzFile(_, e) => Some(e),
            Self::Seed(e) => Some(e),
            Self::Scan(e) => Some(e),
            Self::PhotoOut(_, e) => Some(e),
            Self::NoSuchReader { .. } | Self::MissingSeed => None,
        }
    }
}
impl From<pcsc::Error> for ToolError {
    fn from(value: pcsc::Error) -> Self { Self::Pcsc(value) }
}
impl From<mrtd_reader::mrz::Error> for ToolError {
    fn from(value: mrtd_reader::mrz::Error) -> Self { Self::Seed(value) }
}
impl From<ScanError> for ToolError {
    fn from(value: ScanError) -> Self { Self::Scan(value) }
}


fn setup_tracing(verbose: bool) {
    let default_level = if verbose { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}


fn reader_names(context: &pcsc::Context) -> Result<Vec<CString>, ToolError> {
    let buf_len = context.list_readers_len()?;
    let mut buf = vec![0u8; buf_len];
    let names = context.list_readers(&mut buf)?
        .map(|name| name.to_owned())
        .collect();
    Ok(names)
}


fn list_readers() -> Result<(), ToolError> {
    let context = pcsc::Context::establish(pcsc::Scope::User)?;
    for (i, reader) in reader_names(&context)?.iter().enumerate() {
        println!("{}: {}", i, reader.to_string_lossy());
    }
    Ok(())
}


fn load_seed(opts: &SeedOpts) -> Result<BacSeed, ToolError> {
    if let Some(path) = &opts.mrz_path {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToolError::MrzFile(path.clone(), e))?;
        return Ok(BacSeed::from_mrz(&text)?);
    }
    match (&opts.document_number, &opts.date_of_birth, &opts.date_of_expiry) {
        (Some(number), Some(birth), Some(expiry))
            => Ok(BacSeed::new(number, birth, expiry)?),
        _ => Err(ToolError::MissingSeed),
    }
}


fn describe(milestone: ScanProgress) -> &'static str {
    match milestone {
        ScanProgress::Access => "accessing chip",
        ScanProgress::PersonalInfo => "personal data read",
        ScanProgress::Photo => "portrait extracted",
        ScanProgress::Verification => "done",
    }
}


fn scan(opts: &ScanOpts) -> Result<(), ToolError> {
    let seed = load_seed(&opts.seed)?;

    let context = pcsc::Context::establish(pcsc::Scope::User)?;
    let reader = reader_names(&context)?
        .into_iter()
        .nth(opts.reader_index)
        .ok_or(ToolError::NoSuchReader { index: opts.reader_index })?;
    debug!(reader = %reader.to_string_lossy(), "using reader");
    let transport = PcscTransport::new(context, reader);

    let scanner = Scanner::new();
    let result = scanner.scan(
        Box::new(transport),
        seed,
        ScanOptions::new(opts.quality),
        |milestone| eprintln!("[{}]", describe(milestone)),
    )?;

    let mrz = &result.mrz;
    println!("access:          {}", result.access);
    println!("document code:   {}", mrz.document_code);
    println!("issuing state:   {}", mrz.issuing_state);
    println!("surname:         {}", mrz.primary_identifier);
    println!("given names:     {}", mrz.secondary_identifier);
    println!("document number: {}", mrz.document_number);
    println!("nationality:     {}", mrz.nationality);
    println!("date of birth:   {}", mrz.date_of_birth);
    println!("gender:          {}", mrz.gender);
    println!("date of expiry:  {}", mrz.date_of_expiry);
    if !mrz.optional_data.is_empty() {
        println!("optional data:   {}", mrz.optional_data);
    }
    if !mrz.check_digit_report.is_valid() {
        println!("check digit mismatches: {:?}", mrz.check_digit_report.mismatches);
    }

    let portrait = &result.portrait;
    println!(
        "portrait:        {} {}x{}, {} bytes",
        portrait.format, portrait.width, portrait.height, portrait.encoded.len(),
    );
    if let Some(path) = &opts.photo_out {
        std::fs::write(path, &portrait.encoded)
            .map_err(|e| ToolError::PhotoOut(path.clone(), e))?;
        println!("portrait written to {}", path.display());
    }
    Ok(())
}


fn main() -> ExitCode {
    let mode = Mode::parse();

    let verbose = match &mode {
        Mode::Scan(opts) => opts.verbose,
        Mode::ListReaders => false,
    };
    setup_tracing(verbose);

    let outcome = match &mode {
        Mode::ListReaders => list_readers(),
        Mode::Scan(opts) => scan(opts),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        },
    }
}
