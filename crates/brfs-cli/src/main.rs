#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use brfs_fs::{DirEntry, Filesystem};
use brfs_types::{
    CSUM_TYPE_BLAKE2B, CSUM_TYPE_CRC32C, CSUM_TYPE_SHA256, CSUM_TYPE_XXHASH64, FT_BLKDEV,
    FT_CHRDEV, FT_DIR, FT_FIFO, FT_REG_FILE, FT_SOCK, FT_SYMLINK,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "brfs", about = "brfs — read-only btrfs image reader")]
struct Cli {
    /// Log verbosity.
    #[arg(long = "log-level", short = 'l', global = true, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock information.
    Info {
        /// Path to the btrfs image.
        image: PathBuf,
    },
    /// List directory contents.
    Ls {
        /// Path to the btrfs image.
        image: PathBuf,
        /// Directory path inside the filesystem.
        #[arg(default_value = "/")]
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Read file content.
    Cat {
        /// Path to the btrfs image.
        image: PathBuf,
        /// File path inside the filesystem.
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    entries: &'a [DirEntry],
}

#[derive(Debug, Serialize)]
struct CatOutput<'a> {
    path: &'a str,
    size: usize,
    content: String,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_filter())
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Info { image } => info(&image),
        Command::Ls { image, path, json } => ls(&image, &path, json),
        Command::Cat { image, path, json } => cat(&image, &path, json),
    }
}

fn open(image: &PathBuf) -> Result<Filesystem> {
    Filesystem::open(image).with_context(|| format!("failed to open image {}", image.display()))
}

fn info(image: &PathBuf) -> Result<()> {
    let fs = open(image)?;
    let sb = fs.superblock();

    println!("label:            {}", sb.label);
    println!("fsid:             {}", format_uuid(&sb.fsid));
    println!("metadata_uuid:    {}", format_uuid(&sb.metadata_uuid));
    println!("generation:       {}", sb.generation);
    println!("total_bytes:      {}", sb.total_bytes);
    println!("bytes_used:       {}", sb.bytes_used);
    println!("sectorsize:       {}", sb.sectorsize);
    println!("nodesize:         {}", sb.nodesize);
    println!("leafsize:         {}", sb.leafsize);
    println!("stripesize:       {}", sb.stripesize);
    println!("csum_type:        {}", csum_type_name(sb.csum_type));
    println!("root_tree:        {:#x} (level {})", sb.root, sb.root_level);
    println!(
        "chunk_tree:       {:#x} (level {})",
        sb.chunk_root, sb.chunk_root_level
    );
    if sb.log_root != 0 {
        println!("log_tree:         {:#x} (level {})", sb.log_root, sb.log_root_level);
    }
    println!("fs_tree:          {:#x}", fs.fs_tree_root());
    println!("num_devices:      {}", sb.num_devices);
    println!("device_id:        {}", sb.dev_item.devid);
    println!("device_uuid:      {}", format_uuid(&sb.dev_item.uuid));
    println!("device_total:     {}", sb.dev_item.total_bytes);
    println!("device_used:      {}", sb.dev_item.bytes_used);
    println!("sys_chunk_array:  {} bytes", sb.sys_chunk_array_size);
    Ok(())
}

fn ls(image: &PathBuf, path: &str, json: bool) -> Result<()> {
    let fs = open(image)?;
    let entries = fs
        .list_directory(path)
        .with_context(|| format!("failed to list {path}"))?;

    if json {
        let output = LsOutput {
            path,
            entries: &entries,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize listing")?
        );
    } else if entries.is_empty() {
        println!("(empty directory)");
    } else {
        println!("{:<10} {:<12} name", "type", "inode");
        for entry in &entries {
            println!(
                "{:<10} {:<12} {}",
                file_type_name(entry.file_type),
                entry.inode,
                entry.name
            );
        }
    }
    Ok(())
}

fn cat(image: &PathBuf, path: &str, json: bool) -> Result<()> {
    let fs = open(image)?;
    let data = fs
        .read_file(path)
        .with_context(|| format!("failed to read {path}"))?;

    if json {
        let output = CatOutput {
            path,
            size: data.len(),
            content: String::from_utf8_lossy(&data).into_owned(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize content")?
        );
    } else {
        std::io::stdout()
            .write_all(&data)
            .context("write file content")?;
    }
    Ok(())
}

fn file_type_name(file_type: u8) -> &'static str {
    match file_type {
        FT_REG_FILE => "file",
        FT_DIR => "dir",
        FT_CHRDEV => "chrdev",
        FT_BLKDEV => "blkdev",
        FT_FIFO => "fifo",
        FT_SOCK => "sock",
        FT_SYMLINK => "symlink",
        _ => "unknown",
    }
}

fn csum_type_name(csum_type: u16) -> &'static str {
    match csum_type {
        CSUM_TYPE_CRC32C => "crc32c",
        CSUM_TYPE_XXHASH64 => "xxhash64",
        CSUM_TYPE_SHA256 => "sha256",
        CSUM_TYPE_BLAKE2B => "blake2b",
        _ => "unknown",
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7],
        uuid[8], uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
    )
}
