use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pagecount_pdf::{count_pages_in_file, count_pages_in_file_async, CountError};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pagecount", about = "Print the page count of a PDF file")]
struct Args {
    /// Path to the PDF file.
    pdf: PathBuf,
    /// How the file bytes are obtained; the parse itself is identical.
    #[arg(long, default_value = "sync", value_parser = ["sync", "async"])]
    mode: String,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };
    let result = match args.mode.as_str() {
        "async" => {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    eprintln!("pagecount: failed to start runtime: {err}");
                    return ExitCode::from(1);
                }
            };
            runtime.block_on(count_pages_in_file_async(&args.pdf))
        }
        _ => count_pages_in_file(&args.pdf),
    };
    match result {
        Ok(pages) => {
            debug!(path = %args.pdf.display(), pages, "counted");
            println!("{pages}");
            ExitCode::SUCCESS
        }
        Err(CountError::Io(err)) => {
            eprintln!("pagecount: {}: {err}", args.pdf.display());
            ExitCode::from(1)
        }
        Err(err @ CountError::PageCountNotFound) => {
            eprintln!("pagecount: {}: {err}", args.pdf.display());
            ExitCode::from(2)
        }
    }
}
