//! Release helper: packs the frontend with the key compiled into this
//! build and renders the app icons.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::archive::{Archive, ArchiveBuilder};
use engine::Decipher;
use image::codecs::ico::IcoEncoder;
use image::imageops::{resize, FilterType};
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use muban_lib::{config, key, logging};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Bundle the muban frontend and icons", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack the frontend into an archive encrypted with the embedded key
    Archive {
        /// Frontend directory (defaults to app/)
        #[arg(long)]
        src: Option<PathBuf>,
        /// Output file (defaults to dist/app.asar, or dist/<exe name> with --append-to)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Append to a copy of this built executable instead of writing a sidecar
        #[arg(long)]
        append_to: Option<PathBuf>,
        /// Glob of files to leave outside the archive (repeatable)
        #[arg(long)]
        unpack: Vec<String>,
    },
    /// Render the icon set used by the bundler
    Icons {
        /// Output directory (defaults to src-tauri/icons)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Archive {
            src,
            out,
            append_to,
            unpack,
        } => run_archive(src, out, append_to, unpack),
        Command::Icons { output_dir } => run_icons(output_dir),
    }
}

fn run_archive(
    src: Option<PathBuf>,
    out: Option<PathBuf>,
    append_to: Option<PathBuf>,
    unpack: Vec<String>,
) -> Result<()> {
    let cfg = config::get_config();
    let workspace = workspace_root()?;
    let src = src.unwrap_or_else(|| workspace.join("app"));
    let out = match (out, &append_to) {
        (Some(out), _) => out,
        (None, Some(exe)) => {
            let name = exe
                .file_name()
                .ok_or_else(|| anyhow!("{} has no file name", exe.display()))?;
            workspace.join("dist").join(name)
        }
        (None, None) => workspace.join("dist").join(engine::archive::SIDECAR_NAME),
    };
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    let entry = src.join(&cfg.protocol.entry);
    if !entry.is_file() {
        bail!("{} has no {}", src.display(), cfg.protocol.entry);
    }

    let mut builder = ArchiveBuilder::new();
    if cfg.archive.encrypted {
        let decipher = Decipher::new(&key::ENCRYPTION_KEY, cfg.archive.iv.as_bytes())
            .context("Invalid archive cipher settings")?;
        builder = builder.encrypt_with(decipher);
    }
    for pattern in &unpack {
        builder = builder
            .unpack(pattern)
            .with_context(|| format!("Invalid unpack pattern {}", pattern))?;
    }
    builder
        .add_dir(&src)
        .with_context(|| format!("Failed to read {}", src.display()))?;

    let bytes = match &append_to {
        Some(exe) => builder.append_to(exe, &out),
        None => builder.write_to(&out),
    }
    .with_context(|| format!("Failed to write {}", out.display()))?;

    // Read back what was written so a broken bundle never ships.
    let written = Archive::open(&out).context("Written archive does not parse")?;
    for listed in written.list() {
        written
            .verify(&listed.path)
            .with_context(|| format!("Integrity check failed for {}", listed.path))?;
    }

    info!(
        out = %out.display(),
        bytes,
        entries = written.list().len(),
        encrypted = cfg.archive.encrypted,
        appended = append_to.is_some(),
        "archive bundled"
    );
    Ok(())
}

fn run_icons(output_dir: Option<PathBuf>) -> Result<()> {
    let target = match output_dir {
        Some(dir) => dir,
        None => workspace_root()?.join("src-tauri").join("icons"),
    };
    fs::create_dir_all(&target).context("Failed to create icon directory")?;

    let master = render_icon(1024);
    for (name, size) in [
        ("32x32.png", 32),
        ("128x128.png", 128),
        ("128x128@2x.png", 256),
        ("icon.png", 512),
    ] {
        let scaled = resize(&master, size, size, FilterType::Lanczos3);
        save_png(&scaled, &target.join(name))?;
    }
    save_ico(
        &resize(&master, 256, 256, FilterType::Lanczos3),
        &target.join("icon.ico"),
    )?;

    info!("Icons saved to {}", target.display());
    Ok(())
}

/// Dark disc with an accent core on a transparent background.
fn render_icon(size: u32) -> RgbaImage {
    let center = (size as f32 - 1.0) / 2.0;
    let outer = size as f32 * 0.45;
    let inner = size as f32 * 0.28;
    RgbaImage::from_fn(size, size, |x, y| {
        let d = ((x as f32 - center).powi(2) + (y as f32 - center).powi(2)).sqrt();
        if d < inner {
            Rgba([232, 90, 60, 255])
        } else if d < outer {
            Rgba([30, 30, 36, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("Failed to save PNG at {}", path.display()))
}

fn save_ico(image: &RgbaImage, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to open ICO file at {}", path.display()))?;
    IcoEncoder::new(file)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .with_context(|| format!("Failed to write ICO at {}", path.display()))
}

fn workspace_root() -> Result<PathBuf> {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    Path::new(manifest_dir)
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Unable to determine workspace root"))
}
