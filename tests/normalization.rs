/*!
Test the preprocessing pipeline end to end
*/
use rand::{rngs::StdRng, SeedableRng};
use stockformer::data::{fake::BarRandomWalk, scale::MinMaxScaler, Bar, Dataset, Pipeline, Split};
use stockformer::Error;

#[test]
fn flat_prices_cannot_be_normalized() {
    let flat = vec![
        Bar {
            o: 10.0,
            h: 10.0,
            l: 10.0,
            c: 10.0
        };
        50
    ];
    let prepared = Pipeline::default().prepare(&flat).unwrap();
    assert_eq!(prepared.len(), 40);
    assert!(prepared.iter().all(|bar| bar.fields().all(|x| x == 0.0)));
    assert!(matches!(
        MinMaxScaler::fit_bars(&prepared),
        Err(Error::DegenerateRange(_))
    ));
}

#[test]
fn splits_are_windowed_separately() {
    let walk = BarRandomWalk::new(StdRng::seed_from_u64(9), 25.0, 0.0, 0.01).unwrap();
    let bars: Vec<Bar> = walk.take(400).collect();
    let prepared = Pipeline::default().prepare(&bars).unwrap();
    assert_eq!(prepared.len(), 390);
    let split = Split::chronological(prepared.len(), 0.1, 0.1).unwrap();
    assert_eq!(split.train, 0..312);
    assert_eq!(split.val, 312..351);
    assert_eq!(split.test, 351..390);

    let scaler = MinMaxScaler::fit_bars(&prepared[split.train.clone()]).unwrap();
    let train = scaler.scale_bars(&prepared[split.train]);
    assert!(train.iter().flat_map(Bar::fields).all(|x| (0.0..=1.0).contains(&x)));
    let val = Dataset::from_bars(&scaler.scale_bars(&prepared[split.val]), 16);
    assert_eq!(val.len(), 39 - 16);
    assert!(val.is_labelled());
}
