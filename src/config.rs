use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use jane_eyre::eyre::{self, Context};
use serde::Deserialize;

/// A set of traces to merge into one build report, usually `batch.toml`.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Batch {
    /// Relative paths are relative to the directory containing the config file.
    pub inputs: Vec<PathBuf>,
    /// Where to write the report JSON. Stdout if None.
    pub output: Option<PathBuf>,
    /// Size of the analysis thread pool. Rayon's default if None.
    pub threads: Option<usize>,
}

impl Batch {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let mut result = String::default();
        File::open(path)
            .wrap_err("Failed to open batch config")?
            .read_to_string(&mut result)?;
        let mut result: Batch = toml::from_str(&result)?;

        if let Some(base) = path.parent() {
            for input in result.inputs.iter_mut() {
                *input = base.join(&*input);
            }
            if let Some(output) = &mut result.output {
                *output = base.join(&*output);
            }
        }

        Ok(result)
    }
}

#[test]
fn test_load() -> eyre::Result<()> {
    let dir = mktemp::Temp::new_dir()?;
    let path = dir.join("batch.toml");
    std::fs::write(
        &path,
        r#"
inputs = ["a.json", "/abs/b.json.gz"]
output = "report.json"
threads = 4
"#,
    )?;
    let batch = Batch::load(&path)?;
    assert_eq!(
        batch,
        Batch {
            inputs: vec![dir.join("a.json"), PathBuf::from("/abs/b.json.gz")],
            output: Some(dir.join("report.json")),
            threads: Some(4),
        }
    );

    std::fs::write(&path, r#"inputs = []"#)?;
    let batch = Batch::load(&path)?;
    assert_eq!((batch.output, batch.threads), (None, None));

    std::fs::write(&path, r#"output = "x.json""#)?;
    assert!(Batch::load(&path).is_err());

    Ok(())
}
