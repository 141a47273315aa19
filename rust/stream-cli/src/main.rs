//! Resumable Streaming Pipelines Command-Line Driver
//!
//! This binary streams JSONL files through a pipeline and prints the
//! records as JSONL, checkpointing its position as it goes.
//!
//! # Usage
//!
//! ```bash
//! # Stream two files, one shard each
//! rsp-stream run data/a.jsonl data/b.jsonl
//!
//! # Shuffle with a seed and keep two columns
//! rsp-stream run data/*.jsonl --shuffle --seed 42 --select id,text
//!
//! # Checkpoint every 500 records, then resume from the newest checkpoint
//! rsp-stream run data/*.jsonl --checkpoint-dir ckpt --checkpoint-every 500
//! rsp-stream run data/*.jsonl --checkpoint-dir ckpt --resume latest
//!
//! # Show a checkpoint header
//! rsp-stream inspect ckpt/stream_1700000000000_000003.ckpt
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_core::checkpoint::{CheckpointReader, CheckpointWriter};
use stream_core::iterable::GenerateExamplesFn;
use stream_core::iterable::RowIter;
use stream_core::records::table_to_rows;
use stream_core::{
    GenKwargs, IterableDataset, Key, LoaderConfig, LoaderState, Record, Result, Row, StreamConfig,
    StreamError, WorkerPoolLoader,
};

/// Resumable streaming over JSONL files
#[derive(Parser, Debug)]
#[command(name = "rsp-stream")]
#[command(about = "Stream JSONL files through a resumable pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream records to stdout as JSONL
    Run(RunArgs),
    /// Print the header of a checkpoint file
    Inspect {
        /// Checkpoint file
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input JSONL files, one shard per file
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (python, arrow, tensor)
    #[arg(long)]
    format: Option<String>,

    /// Shuffle shards and records with a bounded buffer
    #[arg(long)]
    shuffle: bool,

    /// Shuffling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Epoch, used to reshuffle between passes
    #[arg(long, default_value = "0")]
    epoch: u64,

    /// Rank of this node
    #[arg(long)]
    rank: Option<usize>,

    /// Number of nodes
    #[arg(long)]
    world_size: Option<usize>,

    /// Records to skip
    #[arg(long)]
    skip: Option<usize>,

    /// Maximum number of records to emit
    #[arg(long)]
    take: Option<usize>,

    /// Comma-separated columns to keep
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    /// Worker threads; 0 iterates in the calling thread
    #[arg(long, default_value = "0")]
    num_workers: usize,

    /// Directory for checkpoints; enables checkpointing
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Records between two checkpoints
    #[arg(long)]
    checkpoint_every: Option<usize>,

    /// Base name of checkpoint files
    #[arg(long, default_value = "stream")]
    checkpoint_name: String,

    /// Checkpoint to resume from, or "latest"
    #[arg(long)]
    resume: Option<String>,
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match cli.command {
        Command::Run(args) => {
            let emitted = run(&args, &mut out)?;
            info!(records = emitted, "Stream finished");
        }
        Command::Inspect { path } => inspect(&path, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

/// Loads the configuration file, applies environment overrides and then
/// command-line flags.
fn load_config(args: &RunArgs) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    }
    .with_env_overrides();

    if let Some(format) = &args.format {
        config.pipeline.format = format.clone();
    }
    if args.shuffle {
        config.pipeline.shuffle = true;
    }
    if args.seed.is_some() {
        config.pipeline.seed = args.seed;
    }
    if let Some(rank) = args.rank {
        config.distributed.rank = rank;
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = world_size;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint.checkpoint_dir = dir.clone();
    }
    if let Some(every) = args.checkpoint_every {
        config.checkpoint.every_n_examples = every;
    }
    config.validate()?;
    Ok(config)
}

/// Reads every file listed under `files`, one JSON object per line. Keys
/// are `{file_stem}_{line}`.
fn read_jsonl(kwargs: &GenKwargs) -> Result<RowIter> {
    let files: Vec<PathBuf> = kwargs
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| StreamError::config("JSONL source is missing its 'files' argument"))?
        .iter()
        .filter_map(|v| v.as_str().map(PathBuf::from))
        .collect();

    let mut readers = Vec::with_capacity(files.len());
    for path in files {
        let file = File::open(&path)
            .map_err(|e| StreamError::storage_with_source(&path, "failed to open input", e))?;
        readers.push((path, BufReader::new(file)));
    }

    let rows = readers.into_iter().flat_map(|(path, reader)| {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        reader
            .lines()
            .enumerate()
            .filter_map(move |(line_no, line)| parse_line(&path, &stem, line_no, line).transpose())
    });
    Ok(Box::new(rows))
}

fn parse_line(
    path: &Path,
    stem: &str,
    line_no: usize,
    line: io::Result<String>,
) -> Result<Option<(Key, Row)>> {
    let line = line.map_err(|e| StreamError::storage_with_source(path, "failed to read input", e))?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(&line)? {
        Value::Object(row) => Ok(Some((Key::Str(format!("{stem}_{line_no}")), row))),
        _ => Err(StreamError::dataset(
            path.display().to_string(),
            format!("line {} is not a JSON object", line_no + 1),
        )),
    }
}

fn build_dataset(args: &RunArgs, config: &StreamConfig) -> Result<IterableDataset> {
    let mut kwargs = GenKwargs::new();
    kwargs.insert(
        "files".to_string(),
        Value::Array(
            args.inputs
                .iter()
                .map(|p| Value::String(p.display().to_string()))
                .collect(),
        ),
    );
    let generate: GenerateExamplesFn = Arc::new(read_jsonl);
    let mut ds = IterableDataset::from_generator(generate, kwargs)?.configure(config)?;
    ds.set_epoch(args.epoch);

    if let Some(n) = args.skip {
        ds = ds.skip(n);
    }
    if let Some(n) = args.take {
        ds = ds.take(n);
    }
    if !args.select.is_empty() {
        ds = ds.select_columns(args.select.as_slice())?;
    }
    debug!(num_shards = ds.num_shards(), "Dataset built");
    Ok(ds)
}

/// The record source of a run: the dataset's own iterator or a worker pool.
enum Stream<'a> {
    Single(stream_core::DatasetIter<'a>),
    Pool(WorkerPoolLoader),
}

impl Stream<'_> {
    fn next_record(&mut self) -> Option<Result<Record>> {
        match self {
            Stream::Single(iter) => iter.next(),
            Stream::Pool(loader) => loader.next(),
        }
    }

    fn checkpoint(&self, writer: &CheckpointWriter, name: &str, epoch: u64) -> Result<PathBuf> {
        match self {
            Stream::Single(iter) => writer.write_state(name, &iter.state_dict()),
            Stream::Pool(loader) => writer.write_json(name, &loader.state_dict(), epoch),
        }
    }
}

fn resolve_resume(resume: &str, reader: &CheckpointReader, name: &str) -> Result<PathBuf> {
    if resume != "latest" {
        return Ok(PathBuf::from(resume));
    }
    reader
        .latest(name)?
        .ok_or_else(|| StreamError::checkpoint(format!("no checkpoint named '{name}' to resume from")))
}

/// Streams the configured pipeline into `out`, returning the number of
/// records written.
fn run(args: &RunArgs, out: &mut impl Write) -> Result<usize> {
    let config = load_config(args)?;
    let mut ds = build_dataset(args, &config)?;
    let reader = CheckpointReader::new(&config.checkpoint.checkpoint_dir);

    let resume_from = match &args.resume {
        Some(resume) => Some(resolve_resume(resume, &reader, &args.checkpoint_name)?),
        None => None,
    };

    let writer = args
        .checkpoint_dir
        .as_ref()
        .map(|_| CheckpointWriter::new(config.checkpoint.clone()));
    let every = config.checkpoint.every_n_examples;
    let epoch = ds.epoch();

    let mut stream = if args.num_workers > 0 {
        let loader_config = LoaderConfig {
            num_workers: args.num_workers,
            ..Default::default()
        };
        let loader = match &resume_from {
            Some(path) => {
                let state: LoaderState = reader.read_json(path)?;
                info!(path = %path.display(), "Resuming worker pool");
                WorkerPoolLoader::resume(&ds, loader_config, state)?
            }
            None => WorkerPoolLoader::new(&ds, loader_config)?,
        };
        Stream::Pool(loader)
    } else {
        if let Some(path) = &resume_from {
            let state = reader.read_state(path)?;
            if state.epoch != epoch {
                warn!(
                    checkpoint_epoch = state.epoch,
                    epoch, "Checkpoint was taken in another epoch and will be ignored"
                );
            }
            info!(path = %path.display(), "Resuming");
            ds.load_state_dict(state);
        }
        Stream::Single(ds.iter()?)
    };

    let mut emitted = 0;
    let mut since_checkpoint = 0;
    while let Some(record) = stream.next_record() {
        let written = write_record(&record?, out)?;
        emitted += written;
        since_checkpoint += written;
        if let Some(writer) = &writer {
            if every > 0 && since_checkpoint >= every {
                stream.checkpoint(writer, &args.checkpoint_name, epoch)?;
                since_checkpoint = 0;
            }
        }
    }
    if let Some(writer) = &writer {
        stream.checkpoint(writer, &args.checkpoint_name, epoch)?;
    }
    Ok(emitted)
}

/// Writes a record as JSONL. Tables are written one line per row.
fn write_record(record: &Record, out: &mut impl Write) -> Result<usize> {
    let rows = match record {
        Record::Row(row) => vec![row.clone()],
        Record::Table(table) => table_to_rows(table)?,
    };
    for row in &rows {
        serde_json::to_writer(&mut *out, row)?;
        out.write_all(b"\n")
            .map_err(|e| StreamError::storage_with_source("<stdout>", "failed to write output", e))?;
    }
    Ok(rows.len())
}

fn inspect(path: &Path, out: &mut impl Write) -> Result<()> {
    let header = CheckpointReader::new(".").read_header(path)?;
    let mut metadata: Vec<_> = header.metadata.iter().collect();
    metadata.sort();
    let metadata: serde_json::Map<String, Value> = metadata
        .into_iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let summary = serde_json::json!({
        "path": path.display().to_string(),
        "magic": String::from_utf8_lossy(&header.magic),
        "version": header.version,
        "compression": header.compression,
        "uncompressed_size": header.uncompressed_size,
        "checksum": format!("{:016x}", header.checksum),
        "epoch": header.epoch(),
        "metadata": metadata,
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)
        .map_err(|e| StreamError::storage_with_source("<stdout>", "failed to write output", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for (name, range) in [("a", 0..4), ("b", 4..7)] {
            let path = dir.join(format!("{name}.jsonl"));
            let mut file = File::create(&path).unwrap();
            for i in range {
                writeln!(file, r#"{{"id": {i}, "text": "t{i}"}}"#).unwrap();
            }
            writeln!(file).unwrap();
            paths.push(path);
        }
        paths
    }

    fn run_args(extra: &[&str], inputs: &[PathBuf]) -> RunArgs {
        let mut argv: Vec<String> = vec!["rsp-stream".into(), "run".into()];
        argv.extend(inputs.iter().map(|p| p.display().to_string()));
        argv.extend(extra.iter().map(|s| s.to_string()));
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            Command::Inspect { .. } => unreachable!(),
        }
    }

    fn ids(output: &[u8]) -> Vec<i64> {
        std::str::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_run_streams_all_files() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let mut out = Vec::new();
        let n = run(&run_args(&[], &inputs), &mut out).unwrap();
        assert_eq!(n, 7);
        assert_eq!(ids(&out), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_skip_take_select() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let mut out = Vec::new();
        let args = run_args(&["--skip", "2", "--take", "3", "--select", "id"], &inputs);
        run(&args, &mut out).unwrap();
        assert_eq!(ids(&out), vec![2, 3, 4]);
        assert!(!std::str::from_utf8(&out).unwrap().contains("text"));
    }

    #[test]
    fn test_arrow_format_prints_rows() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let mut out = Vec::new();
        run(&run_args(&["--format", "arrow"], &inputs), &mut out).unwrap();
        assert_eq!(ids(&out), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_node_split() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let mut out = Vec::new();
        run(&run_args(&["--rank", "1", "--world-size", "2"], &inputs), &mut out).unwrap();
        assert_eq!(ids(&out), vec![4, 5, 6]);
    }

    #[test]
    fn test_checkpoint_and_resume_latest() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let ckpt = temp.path().join("ckpt").display().to_string();

        let mut out = Vec::new();
        let args = run_args(
            &["--take", "5", "--checkpoint-dir", &ckpt, "--checkpoint-every", "2"],
            &inputs,
        );
        run(&args, &mut out).unwrap();
        assert_eq!(ids(&out), vec![0, 1, 2, 3, 4]);
        std::thread::sleep(std::time::Duration::from_millis(10));

        // The final checkpoint is at the end of the take.
        let mut out = Vec::new();
        let args = run_args(&["--take", "5", "--checkpoint-dir", &ckpt, "--resume", "latest"], &inputs);
        assert_eq!(run(&args, &mut out).unwrap(), 0);

        // An earlier checkpoint resumes mid-stream.
        let reader = CheckpointReader::new(&ckpt);
        let dir = PathBuf::from(&ckpt);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        assert_eq!(files.len(), 3);
        let oldest = files[0].display().to_string();
        assert_eq!(reader.read_header(&files[0]).unwrap().epoch(), Some(0));

        let mut out = Vec::new();
        run(&run_args(&["--take", "5", "--resume", &oldest], &inputs), &mut out).unwrap();
        assert_eq!(ids(&out), vec![4]);
    }

    #[test]
    fn test_worker_pool_resume() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let ckpt = temp.path().join("ckpt").display().to_string();

        let mut out = Vec::new();
        let args = run_args(
            &["--num-workers", "2", "--checkpoint-dir", &ckpt, "--checkpoint-every", "3"],
            &inputs,
        );
        run(&args, &mut out).unwrap();
        let mut all = ids(&out);
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        std::thread::sleep(std::time::Duration::from_millis(10));

        let mut out = Vec::new();
        let args = run_args(&["--num-workers", "2", "--checkpoint-dir", &ckpt, "--resume", "latest"], &inputs);
        assert_eq!(run(&args, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_bad_line_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\": 0}\n[1, 2]\n").unwrap();
        let mut out = Vec::new();
        let err = run(&run_args(&[], &[path]), &mut out).unwrap_err();
        assert!(matches!(err, StreamError::Dataset { .. }));
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn test_resume_latest_without_checkpoint() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let ckpt = temp.path().join("empty").display().to_string();
        let mut out = Vec::new();
        let args = run_args(&["--checkpoint-dir", &ckpt, "--resume", "latest"], &inputs);
        assert!(matches!(run(&args, &mut out), Err(StreamError::Checkpoint { .. })));
    }

    #[test]
    fn test_inspect() {
        let temp = TempDir::new().unwrap();
        let inputs = write_inputs(temp.path());
        let ckpt = temp.path().join("ckpt");
        let ckpt_arg = ckpt.display().to_string();
        let mut out = Vec::new();
        run(&run_args(&["--take", "1", "--checkpoint-dir", &ckpt_arg], &inputs), &mut out).unwrap();

        let path = CheckpointReader::new(&ckpt).latest("stream").unwrap().unwrap();
        let mut out = Vec::new();
        inspect(&path, &mut out).unwrap();
        let summary: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(summary["magic"], "RSPC");
        assert_eq!(summary["epoch"], 0);
        assert_eq!(summary["compression"], "lz4");
    }
}
