use std::env;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Instant;

#[macro_use]
extern crate log;

use anyhow::Result;
use thiserror::Error;

use libconerec::configuration::{ReconConfig, ReconConfigBuilder};
use libconerec::{setup_logger, start_reconstruction};

#[derive(Debug, Error)]
pub enum ArgsParsingError {
    #[error("File not found (received {0:?})")]
    FileNotFound(PathBuf),
    #[error("Unsupported extension (found {0})")]
    WrongExtension(String),
    #[error("Expected an input and an output path, with an optional TOML configuration")]
    WrongArgumentCount,
}

pub struct ValidatedArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
}

struct ArgsWithCorrectExtension {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
}

impl ArgsWithCorrectExtension {
    pub fn parse(self) -> Result<ValidatedArgs, ArgsParsingError> {
        match self.input.extension().and_then(OsStr::to_str) {
            Some("pgm") | Some("dat") => {}
            _ => {
                return Err(ArgsParsingError::WrongExtension(
                    "Wrong input given (expected PGM or DAT)".to_string(),
                ))
            }
        }
        match self.output.extension().and_then(OsStr::to_str) {
            Some("nrrd") | Some("raw") => {}
            _ => {
                return Err(ArgsParsingError::WrongExtension(
                    "Wrong output given (expected NRRD or RAW)".to_string(),
                ))
            }
        }
        if let Some(config) = &self.config {
            if config.extension() != Some(OsStr::new("toml")) {
                return Err(ArgsParsingError::WrongExtension(
                    "Wrong configuration given (expected TOML)".to_string(),
                ));
            }
        }
        Ok(ValidatedArgs {
            input: self.input,
            output: self.output,
            config: self.config,
        })
    }
}

struct ArgsThatExistOnDisk {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
}

impl ArgsThatExistOnDisk {
    pub fn parse(self) -> Result<ArgsWithCorrectExtension, ArgsParsingError> {
        if !self.input.exists() {
            return Err(ArgsParsingError::FileNotFound(self.input));
        }
        if let Some(config) = &self.config {
            if !config.exists() {
                return Err(ArgsParsingError::FileNotFound(config.clone()));
            }
        }
        Ok(ArgsWithCorrectExtension {
            input: self.input,
            output: self.output,
            config: self.config,
        })
    }
}

struct CorrectNumberOfArgs<'a> {
    pub args: &'a [String],
}

impl<'a> CorrectNumberOfArgs<'a> {
    pub fn parse(self) -> Result<ArgsThatExistOnDisk, ArgsParsingError> {
        match self.args.len() {
            2 | 3 => Ok(ArgsThatExistOnDisk {
                input: PathBuf::from(&self.args[0]),
                output: PathBuf::from(&self.args[1]),
                config: self.args.get(2).map(PathBuf::from),
            }),
            _ => Err(ArgsParsingError::WrongArgumentCount),
        }
    }
}

/// Asserts that the argument list to our software was given according to
/// the specs
fn validate_and_parse_args(args: &[String]) -> Result<ValidatedArgs, ArgsParsingError> {
    CorrectNumberOfArgs { args }
        .parse()
        .and_then(|exist_on_disk| {
            exist_on_disk
                .parse()
                .and_then(|correct_extension| correct_extension.parse())
        })
}

/// Runs a reconstruction from the CLI
fn main() -> Result<()> {
    setup_logger(Some(PathBuf::from("target/conerec.log")));
    info!("Logger initialized successfully, starting conerec from the CLI");
    let args: Vec<String> = env::args().collect();
    let validated = validate_and_parse_args(&args[1..])?;
    let config = match &validated.config {
        Some(path) => ReconConfig::try_from_config_path(path)?,
        None => ReconConfigBuilder::default().build(),
    };
    let start = Instant::now();
    start_reconstruction(&config, &validated.input, &validated.output)?;
    info!("Reconstruction finished in {:.2?}", start.elapsed());
    Ok(())
}
