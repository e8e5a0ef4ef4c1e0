/*!
Daily price history IO, as headerless `open,high,low,close` CSV
*/
use super::Bar;
use crate::{Error, Result};
use std::io::{Read, Write};

fn reader<R: Read>(rdr: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(rdr)
}

/// Read price history from a Reader. Every record must hold exactly four prices
pub fn read_bars<R: Read>(rdr: R) -> Result<Vec<Bar>> {
    deserialize_bars(rdr)
        .enumerate()
        .map(|(row, result)| {
            result.map_err(|err| match err.kind() {
                csv::ErrorKind::Deserialize { .. } | csv::ErrorKind::UnequalLengths { .. } => {
                    Error::Data(format!("row {}: {}", row + 1, err))
                }
                _ => Error::Csv(err),
            })
        })
        .collect()
}

/// Deserialize price history lazily
pub fn deserialize_bars<R: Read>(rdr: R) -> impl Iterator<Item = Result<Bar, csv::Error>> {
    reader(rdr).into_deserialize()
}

/// Write price history to a Writer
/// On success, return how many bars were written
pub fn write_bars<W, I>(wtr: W, bars: I) -> Result<usize>
where
    W: Write,
    I: Iterator<Item = Bar>,
{
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(wtr);
    let mut written = 0;
    for bar in bars {
        wtr.serialize(bar)?;
        written += 1;
    }
    wtr.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_headerless_rows() {
        let data = "10.0,11.5,9.5,11.0\n 11.0, 12.0 ,10.0,11.5\n";
        let bars = read_bars(data.as_bytes()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(
            bars[1],
            Bar {
                o: 11.0,
                h: 12.0,
                l: 10.0,
                c: 11.5
            }
        );
    }

    #[test]
    fn malformed_rows_are_errors() {
        let data = "10.0,11.5,9.5,11.0\n11.0,abc,10.0,11.5\n";
        match read_bars(data.as_bytes()) {
            Err(Error::Data(msg)) => assert!(msg.starts_with("row 2"), "{}", msg),
            other => panic!("expected a data error, got {:?}", other),
        }
        let short = "10.0,11.5,9.5\n";
        assert!(read_bars(short.as_bytes()).is_err());
    }
}
