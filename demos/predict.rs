/*!
Load a trained model bundle and predict on, or trade through, daily price history
*/
use anyhow::format_err;
use clap::{App, Arg};
use io_enum::*;
use std::fs::File;
use std::io::{stdin, stdout, BufWriter, Stdin, Stdout, Write};
use std::path::Path;
use stockformer::bundle;
use stockformer::config::RunConfig;
use stockformer::data::history::read_bars;
use stockformer::signal::{write_signals, Backtest};
use stockformer::util::{parse_device, setup_logging, verbosity_level};
use tracing::info;

#[derive(Debug, Read)]
pub enum IoSources {
    Stdin(Stdin),
    File(File),
}

#[derive(Debug, Write)]
pub enum IoSinks {
    Stdout(Stdout),
    File(BufWriter<File>),
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("Stockformer Predictor")
        .version("1.0")
        .author("Jad Elkhaleq Ghalayini <jad.ghalayini@mail.utoronto.ca>")
        .about("Loads a model bundle and turns its predictions on price history into buy (1), sell (-1) and hold (0) signals")
        .arg(
            Arg::with_name("BUNDLE")
                .help("The trained model bundle")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Price history as headerless open,high,low,close CSV. Defaults to stdin")
                .index(2),
        )
        .arg(
            Arg::with_name("testing")
                .short("t")
                .long("testing")
                .help("Trade through these upcoming bars one day at a time, printing one signal per day")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .help("Where to write the output. Defaults to stdout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .help("A TOML run configuration; the bundle must match its window length and preprocessing")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .help("Device to use: cuda, cpu. Defaults to cpu")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Sets the level of verbosity")
                .takes_value(true),
        )
        .get_matches();

    let config_path = matches.value_of("config");
    let config = RunConfig::load_or_default(config_path)?;
    match matches.value_of("verbose") {
        Some(v) => setup_logging(verbosity_level(v.parse()?)),
        None => setup_logging(&config.logging.level),
    }
    let device = parse_device(matches.value_of("device").unwrap_or("cpu"))?;

    let bundle_path = matches.value_of("BUNDLE").ok_or_else(|| format_err!("no bundle"))?;
    let loaded = if config_path.is_some() {
        let loaded = bundle::load_expecting(bundle_path, device, config.model.seq_len)?;
        loaded.expect_pipeline(&config.data.pipeline())?;
        loaded
    } else {
        bundle::load(bundle_path, device)?
    };
    let mut backtest = Backtest::from_bundle(&loaded)?;
    backtest.min_change = config.trading.min_change;

    let reader = if let Some(path) = matches.value_of("INPUT") {
        IoSources::File(File::open(Path::new(path))?)
    } else {
        IoSources::Stdin(stdin())
    };
    let bars = read_bars(reader)?;
    info!("Read {} bars of history", bars.len());

    let mut out = if let Some(path) = matches.value_of("output") {
        IoSinks::File(BufWriter::new(File::create(Path::new(path))?))
    } else {
        IoSinks::Stdout(stdout())
    };

    if let Some(testing) = matches.value_of("testing") {
        let upcoming = read_bars(File::open(Path::new(testing))?)?;
        let history = &bars[bars.len().saturating_sub(config.trading.lookback)..];
        let steps = backtest.trade(history, &upcoming)?;
        write_signals(&mut out, steps.iter().map(|step| step.signal))?;
    } else {
        for step in backtest.run(&bars)? {
            writeln!(out, "{},{},{}", step.index, step.prediction, step.signal)?;
        }
        out.flush()?;
    }
    Ok(())
}
