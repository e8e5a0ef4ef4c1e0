/*!
Generate fake price history, for testing purposes
*/
use super::Bar;
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError};

/// Generate fake daily bars using a geometric random walk on the closing price
#[derive(Debug, Clone)]
pub struct BarRandomWalk<R> {
    /// The RNG used by this random walk
    pub rng: R,
    /// The closing price of the last generated bar
    pub price: f64,
    /// The distribution of daily log returns
    pub returns: Normal<f64>,
    /// The distribution of the intraday range, as a fraction of the price
    pub range: Normal<f64>,
}

impl<R: Rng> BarRandomWalk<R> {
    /// Create a random walk starting at `price` with a given daily drift and volatility of log returns
    pub fn new(rng: R, price: f64, drift: f64, volatility: f64) -> Result<BarRandomWalk<R>, NormalError> {
        Ok(BarRandomWalk {
            rng,
            price,
            returns: Normal::new(drift, volatility)?,
            range: Normal::new(0.0, volatility)?,
        })
    }
}

impl<R: Rng> Iterator for BarRandomWalk<R> {
    type Item = Bar;

    fn next(&mut self) -> Option<Bar> {
        let o = self.price;
        let c = o * self.returns.sample(&mut self.rng).exp();
        let h = o.max(c) * (1.0 + self.range.sample(&mut self.rng).abs());
        let l = o.min(c) * (1.0 - self.range.sample(&mut self.rng).abs()).max(0.5);
        self.price = c;
        Some(Bar { o, h, l, c })
    }
}
