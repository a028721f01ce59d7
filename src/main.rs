use std::{
    env::args,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use jane_eyre::eyre::{self, bail, OptionExt};
use tracing::{error_span, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trace_report::{
    config::Batch,
    file::{analyse_files, build_report, format_duration, format_total_duration, short_directory},
    hierarchy::annotate_self_time,
    json::{decode, encode},
    summary::Summary,
};

fn main() -> eyre::Result<()> {
    jane_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive("trace_report=info".parse()?)
                .from_env_lossy(),
        )
        .init();

    let mode = args()
        .nth(1)
        .ok_or_eyre("Usage: trace-report <summary|report|annotate|batch> ...")?;
    let args = args().skip(2).collect::<Vec<_>>();

    match &*mode {
        // Usage: trace-report summary <trace ...>
        "summary" => summary(&paths(&args)),
        // Usage: trace-report report <build trace ...>
        "report" => report(&paths(&args), None),
        // Usage: trace-report annotate <build trace>
        "annotate" => annotate(Path::new(
            args.first().ok_or_eyre("Usage: trace-report annotate <trace>")?,
        )),
        // Usage: trace-report batch <batch.toml>
        "batch" => batch(Path::new(
            args.first().ok_or_eyre("Usage: trace-report batch <batch.toml>")?,
        )),
        other => bail!("Unknown command: {other}"),
    }
}

fn paths(args: &[String]) -> Vec<PathBuf> {
    args.iter().map(PathBuf::from).collect()
}

fn summary(paths: &[PathBuf]) -> eyre::Result<()> {
    let outcomes = analyse_files(paths);
    let analyses = outcomes
        .iter()
        .filter_map(|(path, outcome)| Some((path, outcome.as_ref().ok()?)))
        .collect::<Vec<_>>();
    let total_duration = analyses.iter().map(|(_, a)| a.duration).sum::<f64>();

    for (path, analysis) in analyses.iter() {
        let span = error_span!("summary", ?path);
        let _enter = span.enter();
        info!(
            "{} {}{} ({})",
            format_duration(analysis.kind, analysis.duration),
            format_total_duration(analysis.duration, total_duration),
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            short_directory(path),
        );
        for line in analysis.thread_summary.lines() {
            info!("  {line}");
        }
    }
    if let Ok(summary) = Summary::of(analyses.iter(), |(_, a)| a.duration) {
        info!("Duration: {summary}");
    }

    Ok(())
}

fn report(paths: &[PathBuf], output: Option<&Path>) -> eyre::Result<()> {
    let outcomes = analyse_files(paths);
    let analyses = outcomes
        .iter()
        .filter_map(|(_, outcome)| outcome.as_ref().ok())
        .collect::<Vec<_>>();
    if analyses.iter().all(|a| a.build.is_none()) {
        warn!("No build traces to report on");
    }
    let report = encode(&build_report(analyses));

    match output {
        Some(output) => {
            info!(?output, "Writing report");
            File::create(output)?.write_all(&report)?;
        }
        None => println!("{}", String::from_utf8_lossy(&report)),
    }

    Ok(())
}

#[tracing::instrument(level = "error")]
fn annotate(path: &Path) -> eyre::Result<()> {
    let mut profile = decode(&std::fs::read(path)?)?;
    let count = annotate_self_time(&mut profile.traceEvents);
    info!(count, "Annotated events with self time");
    println!("{}", String::from_utf8_lossy(&encode(&profile)));

    Ok(())
}

#[tracing::instrument(level = "error")]
fn batch(config_path: &Path) -> eyre::Result<()> {
    let batch = Batch::load(config_path)?;
    info!(inputs = batch.inputs.len(), "Loaded batch");
    if let Some(threads) = batch.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }

    report(&batch.inputs, batch.output.as_deref())
}
