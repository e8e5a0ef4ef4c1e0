/*!
Train a stock transformer on daily price history and save it as a bundle
*/

use anyhow::format_err;
use clap::{App, Arg};
use std::fs::File;
use std::path::Path;
use stockformer::bundle;
use stockformer::config::RunConfig;
use stockformer::data::{history::read_bars, scale::MinMaxScaler, Dataset};
use stockformer::train::Trainer;
use stockformer::util::{parse_device, setup_logging, verbosity_level};
use tch::nn::VarStore;
use tracing::{info, warn};

pub fn run(config: RunConfig, input: &Path, output: &Path, device: tch::Device) -> anyhow::Result<()> {
    // Load and prepare the price history
    let bars = read_bars(File::open(input)?)?;
    info!("Read {} bars from {}", bars.len(), input.display());
    let pipeline = config.data.pipeline();
    let prepared = pipeline.prepare(&bars)?;
    let split = config.data.split(prepared.len())?;

    // Normalize everything against the training slice only
    let scaler = MinMaxScaler::fit_bars(&prepared[split.train.clone()])?;
    info!("Input range: [{}, {}]", scaler.min, scaler.max);
    let seq_len = config.model.seq_len;
    let window = |range: std::ops::Range<usize>| {
        Dataset::from_bars(&scaler.scale_bars(&prepared[range]), seq_len)
    };
    let (train, val, test) = (window(split.train), window(split.val), window(split.test));
    if train.is_empty() {
        return Err(format_err!(
            "{} bars are too few to train on windows of {} steps",
            bars.len(),
            seq_len
        ));
    }
    if val.is_empty() {
        warn!("No validation windows: the best epoch will be picked by training loss");
    }

    // Network setup
    let mut vs = VarStore::new(device);
    let model = config.model.build(&vs.root())?;
    let trainer = Trainer::new(config.training.clone(), Some(scaler), pipeline);
    let history = trainer.fit(&model, &mut vs, &train, &val)?;

    let best = history
        .iter()
        .min_by(|a, b| a.score().total_cmp(&b.score()))
        .ok_or_else(|| format_err!("training ran no epochs"))?;
    println!("Best epoch: {} (score {:.6})", best.epoch, best.score());
    if !test.is_empty() {
        let metrics = trainer.evaluate(&model, &test)?;
        println!(
            "Test: loss = {:.6}, mae = {:.6}, mape = {:.2}%",
            metrics.loss, metrics.mae, metrics.mape
        );
    }

    bundle::save(output, &model.desc, Some(&scaler), pipeline, &vs)?;
    println!("Saved model to {}", output.display());
    Ok(())
}

pub fn main() -> anyhow::Result<()> {
    // Initialization, argument parsing
    let matches = App::new("Stockformer Trainer")
        .version("1.0")
        .author("Jad Elkhaleq Ghalayini <jad.ghalayini@mail.utoronto.ca>")
        .about("Trains a transformer to predict the next day's price change of a stock")
        .arg(
            Arg::with_name("INPUT")
                .help("Daily price history as headerless open,high,low,close CSV")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .help("A TOML run configuration. Defaults are used for anything missing")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .help("Device to use: cuda, cpu. Defaults to cuda")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .help("Where to save the trained model. Defaults to model.stkfmr")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("epochs")
                .short("e")
                .long("epochs")
                .help("Overrides the configured number of epochs")
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

    let mut config = RunConfig::load_or_default(matches.value_of("config"))?;
    if let Some(epochs) = matches.value_of("epochs") {
        config.training.epochs = epochs.parse()?;
        config.validate()?;
    }
    match matches.value_of("verbose") {
        Some(v) => setup_logging(verbosity_level(v.parse()?)),
        None => setup_logging(&config.logging.level),
    }

    let device = parse_device(matches.value_of("device").unwrap_or("cuda"))?;
    info!("Device: {:?}", device);

    let input = Path::new(matches.value_of("INPUT").ok_or_else(|| format_err!("no input file"))?);
    let output = Path::new(matches.value_of("output").unwrap_or("model.stkfmr"));
    run(config, input, output, device)
}
