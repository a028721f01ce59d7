use std::fmt::Display;

use jane_eyre::eyre::{self, OptionExt};

/// Descriptive statistics over one value taken from each of a set of files.
#[derive(Debug, PartialEq)]
pub struct Summary<T> {
    pub n: usize,
    pub mean: T,
    pub stdev: T,
    pub min: T,
    pub max: T,
}

impl Summary<f64> {
    /// Summarises the values the getter returns, skipping items where it returns None.
    pub fn of<Item, T: Into<Option<f64>>>(
        items: impl IntoIterator<Item = Item>,
        mut getter: impl FnMut(&Item) -> T,
    ) -> eyre::Result<Self> {
        let xs = items
            .into_iter()
            .filter_map(|x| getter(&x).into())
            .collect::<Vec<f64>>();
        let n = xs.len();
        let mean = xs.iter().sum::<f64>() / (n as f64);
        let stdev = if n > 1 {
            (xs.iter().map(|x| (x - mean).powf(2.0)).sum::<f64>() / ((n - 1) as f64)).sqrt()
        } else {
            0.0
        };
        let min = xs
            .iter()
            .cloned()
            .min_by(|p, q| p.total_cmp(q))
            .ok_or_eyre("No minimum")?;
        let max = xs
            .iter()
            .cloned()
            .max_by(|p, q| p.total_cmp(q))
            .ok_or_eyre("No maximum")?;

        Ok(Summary {
            n,
            mean,
            stdev,
            min,
            max,
        })
    }
}

/// Seconds in the largest unit that keeps the value at least 1, with up to four significant
/// digits.
pub fn fmt_seconds(x: f64) -> String {
    let (value, unit) = if x >= 1.0 {
        (x, "s")
    } else if x * 1000.0 >= 1.0 {
        (x * 1000.0, "ms")
    } else if x * 1000000.0 >= 1.0 {
        (x * 1000000.0, "μs")
    } else {
        (x * 1000000000.0, "ns")
    };
    let dp: usize = if value >= 1000.0 {
        0
    } else if value >= 100.0 {
        1
    } else if value >= 10.0 {
        2
    } else {
        3
    };

    format!("{value:.dp$}{unit}")
}

impl Display for Summary<f64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={}, μ={}, s={}, min={}, max={}",
            self.n,
            fmt_seconds(self.mean),
            fmt_seconds(self.stdev),
            fmt_seconds(self.min),
            fmt_seconds(self.max),
        )
    }
}

#[test]
fn test_summary() -> eyre::Result<()> {
    let summary = Summary::of([Some(1.0), None, Some(3.0)], |x| *x)?;
    assert_eq!(summary.n, 2);
    assert_eq!(summary.mean, 2.0);
    assert_eq!(summary.min, 1.0);
    assert_eq!(summary.max, 3.0);
    assert!((summary.stdev - 2f64.sqrt()).abs() < 1e-12);
    assert_eq!(
        summary.to_string(),
        "n=2, μ=2.000s, s=1.414s, min=1.000s, max=3.000s"
    );

    let single = Summary::of([0.0025], |x| *x)?;
    assert_eq!(single.stdev, 0.0);
    assert_eq!(fmt_seconds(single.mean), "2.500ms");

    assert!(Summary::of(Vec::<f64>::new(), |x| *x).is_err());

    Ok(())
}

#[test]
fn test_fmt_seconds() {
    assert_eq!(fmt_seconds(1234.4), "1234s");
    assert_eq!(fmt_seconds(0.0123), "12.30ms");
    assert_eq!(fmt_seconds(0.000_150), "150.0μs");
    assert_eq!(fmt_seconds(0.0), "0.000ns");
}
