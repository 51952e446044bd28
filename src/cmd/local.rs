use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser};

use super::StoreArgs;
use crate::config::EngineConfig;
use crate::driver::{BucketDriver, ChainedDriver, Driver, GlobDriver, MultiDriver, ParquetDriver};
use crate::error::Result;
use crate::store::{parse_s3_url, ObjectStore};

#[derive(Parser, Debug)]
#[command(version, about = "Run a MapReduce workload on the local engine", long_about = None)]
pub struct Args {
    /// Input: a glob, a directory, a `.parquet` file or `s3://bucket/prefix`.
    /// May be repeated.
    #[arg(short, long, required = true)]
    pub input: Vec<String>,

    /// Name of the workload
    #[arg(short, long)]
    pub workload: String,

    /// Output file, stdout if absent. A `.parquet` suffix writes parquet.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON engine configuration; flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub mappers: Option<usize>,

    #[arg(short, long)]
    pub reducers: Option<usize>,

    /// Capacity of each record queue
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Read the inputs one after another instead of concurrently
    #[arg(long)]
    pub chain: bool,

    #[command(flatten)]
    pub store: StoreArgs,

    /// More logging; repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Option<Vec<String>>,
}

impl Args {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(mappers) = self.mappers {
            config.mappers = mappers;
        }
        if let Some(reducers) = self.reducers {
            config.reducers = reducers;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(args) = &self.args {
            config.args = args.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Parquet output is chosen by suffix.
    pub fn parquet_output(&self) -> Option<&Path> {
        self.output
            .as_deref()
            .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
    }

    /// One driver over every input.
    pub async fn driver(&self) -> Result<Box<dyn Driver>> {
        let store = if self.input.iter().any(|input| input.starts_with("s3://")) {
            Some(self.store.open().await)
        } else {
            None
        };
        let mut drivers = self
            .input
            .iter()
            .map(|input| input_driver(input, store.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if drivers.len() == 1 {
            return Ok(drivers.remove(0));
        }
        Ok(if self.chain {
            Box::new(ChainedDriver::new(drivers))
        } else {
            Box::new(MultiDriver::new(drivers))
        })
    }
}

fn input_driver(input: &str, store: Option<&Arc<dyn ObjectStore>>) -> Result<Box<dyn Driver>> {
    if let Some(store) = store.filter(|_| input.starts_with("s3://")) {
        let (bucket, prefix) = parse_s3_url(input)?;
        return Ok(Box::new(BucketDriver::new(Arc::clone(store), bucket, prefix)));
    }
    let path = Path::new(input);
    Ok(if path.extension().is_some_and(|ext| ext == "parquet") {
        Box::new(ParquetDriver::new(path))
    } else if path.is_dir() {
        Box::new(GlobDriver::dir(path))
    } else {
        Box::new(GlobDriver::new(input))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "mrs-local", "-i", "in/*", "-w", "grep", "-r", "3", "--", "--term", "fox",
        ]);
        let config = args.engine_config().unwrap();
        assert_eq!(config.reducers, 3);
        assert_eq!(config.args, vec!["--term", "fox"]);
        assert!(args.parquet_output().is_none());
    }

    #[test]
    fn parquet_output_by_suffix() {
        let args = Args::parse_from(["mrs-local", "-i", "x", "-w", "wc", "-o", "out.parquet"]);
        assert_eq!(args.parquet_output(), Some(Path::new("out.parquet")));
    }
}
