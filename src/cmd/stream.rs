use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use super::StoreArgs;
use crate::config::StreamingConfig;
use crate::error::Result;
use crate::streaming::{Encoding, Fetcher, Input, InputSource};

#[derive(Parser, Debug)]
#[command(version, about = "Run one step of a workload over the key TAB value line protocol", long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    /// JSON streaming configuration; flags override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More logging; repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Map every input line, writing map output unsorted
    Map(Step),
    /// Reduce key-sorted input lines, one job per key
    Reduce(Step),
}

#[derive(clap::Args, Debug)]
pub struct Step {
    /// Name of the workload
    #[arg(short, long)]
    pub workload: String,

    /// `-` for stdin, a path, an http(s) URL or `s3://bucket/key`
    #[arg(short, long, default_value = "-")]
    pub input: String,

    /// Compression of the input: identity, gzip or bzip2. Guessed from the
    /// name when absent.
    #[arg(short, long, value_parser = parse_encoding)]
    pub encoding: Option<Encoding>,

    /// The input is JSON lines of `{"url": ..., "encoding": ...}`, each
    /// naming a source to stream
    #[arg(long)]
    pub indirect: bool,

    /// Output file, stdout if absent
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(short, long)]
    pub mappers: Option<usize>,

    #[arg(short, long)]
    pub reducers: Option<usize>,

    /// Period of the keep-alive counter, e.g. `15m`
    #[arg(long, value_parser = parse_duration)]
    pub heartbeat: Option<Duration>,

    /// Retries when opening an indirect source
    #[arg(long)]
    pub retries: Option<u32>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Option<Vec<String>>,
}

fn parse_encoding(s: &str) -> std::result::Result<Encoding, String> {
    s.parse().map_err(|err: crate::Error| err.to_string())
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|err| err.to_string())
}

impl Step {
    pub fn streaming_config(&self, file: Option<&Path>) -> Result<StreamingConfig> {
        let mut config = match file {
            Some(path) => StreamingConfig::from_json_file(path)?,
            None => StreamingConfig::default(),
        };
        if let Some(mappers) = self.mappers {
            config.mappers = mappers;
        }
        if let Some(reducers) = self.reducers {
            config.reducers = reducers;
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat = heartbeat;
        }
        if let Some(retries) = self.retries {
            config.retry.retries = retries;
        }
        if let Some(args) = &self.args {
            config.args = args.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn input(&self) -> Result<Input> {
        let source: InputSource = self.input.parse()?;
        let input = if self.indirect {
            Input::indirect(source)
        } else {
            Input::direct(source)
        };
        Ok(match self.encoding {
            Some(encoding) => input.with_encoding(encoding),
            None => input,
        })
    }

    /// A fetcher that can also read `s3://` sources when any may appear.
    pub async fn fetcher(&self) -> Fetcher {
        if self.indirect || self.input.starts_with("s3://") {
            Fetcher::new().with_store(self.store.open().await)
        } else {
            Fetcher::new()
        }
    }
}
