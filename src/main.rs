use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tbmp_fit::attributes::{Length, RequestAttributes};
use tbmp_fit::document::PieceIdAllocator;
use tbmp_fit::{config, output, process};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Per-image directives applied to every input file.
#[derive(clap::Args, Clone, Default)]
struct AttributeArgs {
    /// Target width in pixels (a trailing % is accepted and ignored)
    #[arg(long)]
    width: Option<String>,

    /// Target height in pixels (a trailing % is accepted and ignored)
    #[arg(long)]
    height: Option<String>,

    /// Bit depth: 1, 2, 4, 8 or 16
    #[arg(long)]
    bpp: Option<u8>,

    /// Crop before scaling, as WxH+X+Y
    #[arg(long)]
    section: Option<String>,

    /// Max width, overriding the config
    #[arg(long)]
    maxwidth: Option<u32>,

    /// Max height, overriding the config
    #[arg(long)]
    maxheight: Option<u32>,

    /// Treat images as embedded in a page (enables alternates)
    #[arg(long)]
    inline: bool,
}

impl AttributeArgs {
    fn to_attributes(&self) -> RequestAttributes {
        RequestAttributes {
            width: self.width.as_deref().and_then(Length::parse),
            height: self.height.as_deref().and_then(Length::parse),
            bpp: self.bpp,
            section: self.section.clone(),
            maxwidth: self.maxwidth,
            maxheight: self.maxheight,
            inline: self.inline,
            ..RequestAttributes::default()
        }
    }
}

#[derive(Parser)]
#[command(name = "tbmp-fit")]
#[command(about = "Fit images into Palm bitmap records")]
#[command(long_about = "\
Fit images into Palm bitmap records

Each record holds at most 60 KiB. Images are scaled into the configured
bounds, then reduced (by bit depth or by size, if enabled) until they fit.
Images that still do not fit are split into a grid of records.

Output:

  out/
  ├── manifest.json          # One entry per input, in order
  ├── dawn.tbmp              # Fits in one record
  ├── panorama-Multi0.tbmp   # Tiled pieces, row-major
  └── dawn-alt.tbmp          # Larger alternate of an --inline image

Run 'tbmp-fit gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Config file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output; repeat for more (overrides the config verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert images into records and write a manifest
    Convert {
        /// Source images
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory
        #[arg(long, default_value = "tbmp-out")]
        output: PathBuf,

        #[command(flatten)]
        attributes: AttributeArgs,
    },
    /// Show the resolved geometry of each image without encoding
    Plan {
        /// Source images
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        attributes: AttributeArgs,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Convert {
            files,
            output: output_dir,
            attributes,
        } => {
            let converter_config = setup(cli.config.as_deref(), cli.verbose)?;
            init_thread_pool(&converter_config.processing);
            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_process_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let manifest = process::process(
                &files,
                &output_dir,
                &converter_config,
                &attributes.to_attributes(),
                &PieceIdAllocator::default(),
                Some(tx),
            );
            printer.join().ok();
            let manifest = manifest?;
            output::print_summary(&manifest, &output_dir);
            if manifest.failed() > 0 {
                std::process::exit(1);
            }
        }
        Command::Plan { files, attributes } => {
            let converter_config = setup(cli.config.as_deref(), cli.verbose)?;
            let entries = process::plan(&files, &converter_config, &attributes.to_attributes());
            output::print_plan(&entries);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Load the config and start logging. `-v` flags override `verbosity`.
fn setup(
    path: Option<&std::path::Path>,
    verbose: u8,
) -> Result<config::ConverterConfig, config::ConfigError> {
    let converter_config = config::load_config(path)?;
    init_logging(if verbose > 0 {
        verbose
    } else {
        converter_config.verbosity
    });
    Ok(converter_config)
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over `verbosity`.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = format!("tbmp_fit={level}");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; user can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
