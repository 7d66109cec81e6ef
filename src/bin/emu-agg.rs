use std::fs::File;
use std::io::{self, BufReader};

use anyhow::{Context, Result};
use numa_emu::aggregate::{Aggregator, RunStream};
use numa_emu::cli::{self, AggregateCli};

fn main() -> Result<()> {
    let cli: AggregateCli = cli::parse_or_exit();
    cli::init_tracing(cli.debug);

    let mut streams = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let file = File::open(path).with_context(|| format!("can't open '{}'", path.display()))?;
        let stream = RunStream::open(path.display().to_string(), BufReader::new(file))?;
        tracing::debug!(source = stream.source_id(), offset = stream.clock_offset(), "stream opened");
        streams.push(stream);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let windows = Aggregator::new(streams).run(&mut out, cli.format)?;
    tracing::debug!(windows, "aggregation finished");

    Ok(())
}
