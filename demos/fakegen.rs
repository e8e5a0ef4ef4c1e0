/*!
Generate fake daily price history as headerless CSV
*/
use anyhow::format_err;
use clap::{App, Arg};
use rand::{rngs::StdRng, SeedableRng};
use std::io::stdout;
use stockformer::data::{fake::BarRandomWalk, history::write_bars};

fn main() -> anyhow::Result<()> {
    let matches = App::new("Fake Price History")
        .version("1.0")
        .author("Jad Elkhaleq Ghalayini <jad.ghalayini@mail.utoronto.ca>")
        .about("Writes a geometric random walk of open,high,low,close bars to stdout")
        .arg(
            Arg::with_name("count")
                .short("n")
                .long("count")
                .help("Bars to generate. Defaults to 1000")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .help("Seed for the random walk. Defaults to a random seed")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("price")
                .long("price")
                .help("The starting price. Defaults to 40")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("volatility")
                .long("volatility")
                .help("The standard deviation of daily log returns. Defaults to 0.02")
                .takes_value(true),
        )
        .get_matches();

    let count: usize = matches.value_of("count").unwrap_or("1000").parse()?;
    let price: f64 = matches.value_of("price").unwrap_or("40").parse()?;
    let volatility: f64 = matches.value_of("volatility").unwrap_or("0.02").parse()?;
    let rng = match matches.value_of("seed") {
        Some(seed) => StdRng::seed_from_u64(seed.parse()?),
        None => StdRng::from_entropy(),
    };
    let walk = BarRandomWalk::new(rng, price, 0.0, volatility)
        .map_err(|err| format_err!("invalid random walk parameters: {:?}", err))?;
    let stdout = stdout();
    write_bars(stdout.lock(), walk.take(count))?;
    Ok(())
}
