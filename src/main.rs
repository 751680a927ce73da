//! `deltapatch` command-line front end.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use deltapatch::apply::{self, ApplyOptions};
use deltapatch::binary_diff::{self, EncodeOptions, DEFAULT_LEVEL};
use deltapatch::binary_patch::{self, DecodeOptions};
use deltapatch::create::{self, PatchBuilder};
use deltapatch::ops::Patch;
use deltapatch::paged::PAGE_SIZE;
use deltapatch::patch_file;

/// Fewest pages a memory ceiling may translate to.
const MIN_PAGES: usize = 8;

#[derive(Parser)]
#[command(name = "deltapatch", version, about = "Binary delta patch creator and applier")]
struct Cli {
    /// Log every operation
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff old trees against a new tree into a patch description plus data store
    Create {
        /// Old (installed) tree; repeat for several prior versions
        #[arg(long, required = true)]
        old: Vec<PathBuf>,
        /// New tree
        #[arg(long)]
        new: PathBuf,
        /// Patch description to write; extended if it already exists
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        product: Option<String>,
        #[arg(long = "patch-version")]
        version: Option<String>,
        #[arg(long)]
        component: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        prepatch: Option<String>,
        #[arg(long)]
        postpatch: Option<String>,
    },
    /// Apply a patch description to an installed tree
    Apply {
        /// Installed tree to patch
        #[arg(long)]
        target: PathBuf,
        /// Patch description file
        #[arg(long, short)]
        patch: PathBuf,
        /// Memory ceiling for delta sources (e.g. 64M)
        #[arg(long, value_parser = parse_max_mem)]
        max_mem: Option<usize>,
        /// Kill hook scripts after this many seconds
        #[arg(long)]
        script_timeout: Option<u64>,
    },
    /// Load a patch description and check its data store
    Verify {
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Encode a single-file delta
    Delta {
        from: PathBuf,
        to: PathBuf,
        output: PathBuf,
        /// zstd level for archive segments; 0 stores them raw
        #[arg(long, default_value_t = DEFAULT_LEVEL, value_parser = clap::value_parser!(i32).range(0..=19))]
        level: i32,
        #[arg(long)]
        no_verify: bool,
        /// Never look inside zstd-compressed inputs
        #[arg(long)]
        pristine: bool,
        #[arg(long, value_parser = parse_max_mem)]
        max_mem: Option<usize>,
    },
    /// Decode a single-file delta
    Patch {
        archive: PathBuf,
        from: PathBuf,
        /// Defaults to the target name recorded in the archive, placed beside it
        output: Option<PathBuf>,
        #[arg(long)]
        pristine: bool,
        #[arg(long, value_parser = parse_max_mem)]
        max_mem: Option<usize>,
    },
    /// Describe a delta archive
    Info { archive: PathBuf },
}

/// Exit status categories.
struct Failure {
    code: u8,
    error: anyhow::Error,
}

impl Failure {
    fn load(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: 2,
            error: error.into(),
        }
    }

    fn apply(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: 3,
            error: error.into(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self { code: 1, error }
    }
}

/// `64M`, `512K`, `1G` or plain bytes, as a page count.
fn parse_max_mem(arg: &str) -> Result<usize, String> {
    let arg = arg.trim();
    let (digits, scale) = match arg.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&arg[..arg.len() - 1], 1u64 << 10),
        Some('M') => (&arg[..arg.len() - 1], 1 << 20),
        Some('G') => (&arg[..arg.len() - 1], 1 << 30),
        _ => (arg, 1),
    };
    let value: u64 = digits.parse().map_err(|_| format!("invalid size: {arg}"))?;
    let bytes = value.saturating_mul(scale);
    let pages = usize::try_from(bytes / PAGE_SIZE as u64).unwrap_or(usize::MAX);
    Ok(pages.max(MIN_PAGES))
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            log::error!("{:#}", failure.error);
            ExitCode::from(failure.code)
        }
    }
}

async fn run(command: Commands) -> Result<(), Failure> {
    match command {
        Commands::Create {
            old,
            new,
            output,
            product,
            version,
            component,
            description,
            prepatch,
            postpatch,
        } => {
            let mut patch = if output.exists() {
                patch_file::load(&output)
                    .with_context(|| format!("Failed to load {}", output.display()))
                    .map_err(Failure::load)?
            } else {
                let (Some(product), Some(version)) = (product.as_deref(), version.as_deref()) else {
                    return Err(anyhow::anyhow!("--product and --patch-version are required for a new patch").into());
                };
                Patch::new(product, version, patch_file::data_dir(&output))
            };
            if let Some(product) = product {
                patch.product = product;
            }
            if let Some(version) = version {
                patch.version = version;
            }
            patch.component = component.or(patch.component);
            if let Some(description) = description {
                patch.description = description;
            }
            patch.prepatch = prepatch.or(patch.prepatch);
            patch.postpatch = postpatch.or(patch.postpatch);

            println!("Creating patch...");
            for dir in &old {
                println!("  Old: {}", dir.display());
            }
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let mut builder = PatchBuilder::from_patch(patch).map_err(Failure::load)?;
            let summary = create::create_patch(&mut builder, &old, &new).await?;
            let patch = builder.finish();
            patch_file::save(&patch, &output).context("Failed to save patch description")?;
            if patch.is_empty() {
                log::warn!("{} and the old tree(s) are identical; the patch has no operations", new.display());
            }

            println!("\nPatch created successfully!");
            println!("  Directories added: {}", summary.dirs_added);
            println!("  Files added: {}", summary.files_added);
            println!("  Files patched: {}", summary.files_patched);
            println!("  Deltas generated: {}", summary.deltas);
            if summary.deltas_without_overlap > 0 {
                println!("  Deltas sharing no data with the old file: {}", summary.deltas_without_overlap);
            }
            println!("  Symlinks: {}", summary.symlinks);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            println!("  Disk space required: {} KiB", patch.required_kib());
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            max_mem,
            script_timeout,
        } => {
            let mut loaded = patch_file::load(&patch)
                .with_context(|| format!("Failed to load {}", patch.display()))
                .map_err(Failure::load)?;
            if !loaded.description.is_empty() {
                println!("{}", loaded.description);
            }
            let opts = ApplyOptions {
                max_pages: max_mem.unwrap_or(usize::MAX),
                script_timeout: script_timeout.map(Duration::from_secs),
            };

            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || apply::apply_patch(&mut loaded, &target, &opts))
                .await
                .map_err(Failure::apply)?
                .with_context(|| format!("Failed to apply {}", patch.display()))
                .map_err(Failure::apply)?;

            println!("\nPatch applied successfully!");
            println!("  Directories created: {}", summary.dirs_created);
            println!("  Files added: {}", summary.files_added);
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files already current: {}", summary.files_current);
            println!("  Symlinks: {}", summary.symlinks);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            if summary.cleanup_failures > 0 {
                println!("  Cleanup failures: {}", summary.cleanup_failures);
            }
            if summary.post_script_failed {
                println!("  Postpatch script failed");
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Verify { patch } => {
            let loaded = patch_file::load(&patch)
                .with_context(|| format!("Failed to load {}", patch.display()))
                .map_err(Failure::load)?;
            verify_store(&loaded).map_err(Failure::load)?;
            println!("{} {}: OK", loaded.product, loaded.version);
        }
        Commands::Delta {
            from,
            to,
            output,
            level,
            no_verify,
            pristine,
            max_mem,
        } => {
            let opts = EncodeOptions {
                level,
                no_verify,
                pristine,
                max_pages: max_mem.unwrap_or(usize::MAX),
            };
            let report = binary_diff::encode_file(&from, &to, &output, &opts)
                .with_context(|| format!("Failed to encode {} -> {}", from.display(), to.display()))?;
            println!(
                "{}: {} bytes ({} copied, {} literal) in {} bytes",
                output.display(),
                report.to_len,
                report.copy_length,
                report.literal_length,
                report.archive_len
            );
        }
        Commands::Patch {
            archive,
            from,
            output,
            pristine,
            max_mem,
        } => {
            let output = match output {
                Some(output) => output,
                None => default_output(&archive).map_err(Failure::load)?,
            };
            let opts = DecodeOptions {
                max_pages: max_mem.unwrap_or(usize::MAX),
                pristine,
            };
            let report = binary_patch::decode_file(&archive, &from, &output, &opts).map_err(Failure::apply)?;
            println!("{}: {} bytes, md5 {}", output.display(), report.to_len, report.to_checksum);
        }
        Commands::Info { archive } => {
            let info = binary_patch::info(&archive).map_err(Failure::load)?;
            println!("Revision:  {}", info.revision);
            println!("Flags:     {:?}", info.flags);
            println!("From name: {}", info.from_name);
            println!("To name:   {}", info.to_name);
            println!("To length: {}", info.control.to_len);
            println!("To md5:    {}", info.control.to_checksum);
            println!("Archive:   {} bytes", info.archive_len);
            println!("Sources:");
            for (index, source) in info.control.sources.iter().enumerate() {
                println!(
                    "  {index}: {} {} bytes md5 {} copies {} copied {}{}",
                    source.name,
                    source.len,
                    source.checksum,
                    source.copies,
                    source.copy_length,
                    if source.sequential { " (sequential)" } else { "" }
                );
            }
            println!("Instructions: {}", info.control.instructions.len());
        }
    }
    Ok(())
}

/// The recorded target name, placed next to the archive.
fn default_output(archive: &Path) -> anyhow::Result<PathBuf> {
    let info = binary_patch::info(archive)?;
    let name = Path::new(&info.to_name);
    match name.file_name() {
        Some(file) => Ok(archive.parent().unwrap_or(Path::new("")).join(file)),
        None => bail!("{} records no target name; pass an output path", archive.display()),
    }
}

/// Every payload and delta the description names must exist, and every
/// delta must be a readable archive.
fn verify_store(patch: &Patch) -> anyhow::Result<()> {
    for op in &patch.add_file {
        let path = patch.store_path(&op.src);
        if !path.is_file() {
            bail!("missing payload {} for {}", path.display(), op.dst);
        }
    }
    for op in &patch.patch_file {
        for option in &op.options {
            let path = patch.store_path(&option.src);
            let info = binary_patch::info(&path).with_context(|| format!("delta for {}", op.dst))?;
            if info.control.to_checksum != option.new_checksum {
                bail!(
                    "{} produces {}, description expects {}",
                    path.display(),
                    info.control.to_checksum,
                    option.new_checksum
                );
            }
        }
    }
    Ok(())
}
