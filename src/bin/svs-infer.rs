//! SVS inference CLI — render a score to WAV with a singer package.
//!
//! ```text
//! svs-infer <package> <input.json> <output.wav> [ep] [device_index]
//! ```
//!
//! The package is a directory containing a `singer.json` manifest. The input
//! document names the singer and carries the score payload. Output is 32-bit
//! float mono PCM at the vocoder's sample rate.
//!
//! Graph execution needs an inference driver registered for the requested
//! execution provider; without one the program exits with a
//! feature-not-supported error. Exit code 0 on success, non-zero on failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use svs_infer_rs::audio::write_wav;
use svs_infer_rs::input::InputDocument;
use svs_infer_rs::package::SingerPackage;
use svs_infer_rs::pipeline::SvsPipeline;
use svs_infer_rs::session::{DriverOptions, ExecutionProvider, RuntimeContext};
use svs_infer_rs::{Error, Result};

/// Name under which an ONNX-runtime driver is expected in the registry.
const DRIVER_NAME: &str = "onnx";

#[derive(Parser, Debug)]
#[command(
    name = "svs-infer",
    about = "Singing-voice-synthesis inference",
    long_about = "Render a score JSON to a WAV file using a singer package.\n\
                  The five models (duration, pitch, variance, acoustic, vocoder)\n\
                  run in sequence on an externally provided inference driver."
)]
struct Args {
    /// Singer package directory (contains singer.json).
    package: PathBuf,

    /// Input score document (JSON).
    input: PathBuf,

    /// Output WAV path.
    output: PathBuf,

    /// Execution provider: cpu, cuda, dml/directml, coreml.
    #[arg(default_value = "cpu")]
    ep: String,

    /// Device index for GPU execution providers.
    #[arg(default_value_t = 0)]
    device_index: i32,
}

fn run(args: &Args, context: &RuntimeContext) -> Result<()> {
    // Unknown execution-provider strings fall back to the CPU.
    let ep = ExecutionProvider::parse(&args.ep).unwrap_or_default();

    let document = InputDocument::load(&args.input)?;
    let package = SingerPackage::load(&args.package)?;
    if package.id != document.singer {
        return Err(Error::InvalidArgument(format!(
            r#"singer "{}" not found in package"#,
            document.singer
        )));
    }

    let driver = context.driver(DRIVER_NAME).ok_or_else(|| {
        Error::FeatureNotSupported(format!(
            "no inference driver registered for execution provider {:?}",
            ep
        ))
    })?;
    driver.initialize(&DriverOptions {
        ep,
        device_index: args.device_index,
    })?;

    let pipeline = SvsPipeline::load(&package, driver)?;
    let mut score = document.score;
    let audio = pipeline.render(&mut score)?;

    write_wav(&args.output, audio.sample_rate, &audio.samples)?;
    tracing::info!(
        "saved {:.2}s of audio to {}",
        audio.samples.len() as f64 / audio.sample_rate as f64,
        args.output.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Drivers for actual neural runtimes register here at startup; the core
    // pipeline is runtime-agnostic.
    let context = RuntimeContext::new();

    match run(&args, &context) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
