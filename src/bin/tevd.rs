//! TEVD command line tool
//!
//! Create, inspect and edit TEVD disk images

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tevd::io::{recover_interrupted_rewrite, Recovery};
use tevd::{
    ByteArray64, CacheConfig, Charset, CrcLevel, DiskSkimmer, EntryContent, PartialDom,
    VirtualDisk,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tevd")]
#[command(about = "Inspect and edit TEVD virtual disk images")]
struct Args {
    /// Encode and decode names as Latin-1 instead of UTF-8
    #[arg(long, global = true)]
    latin1: bool,

    /// Cache configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty disk image
    New {
        image: PathBuf,
        /// Capacity in bytes
        #[arg(short, long, default_value = "1048576")]
        capacity: u64,
        /// Disk name (up to 32 bytes)
        #[arg(short, long, default_value = "TEVD")]
        name: String,
    },
    /// Print the disk header and usage
    Info { image: PathBuf },
    /// List a directory
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file's contents to stdout
    Cat { image: PathBuf, path: String },
    /// Copy a host file into the image
    Put {
        image: PathBuf,
        source: PathBuf,
        path: String,
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Remove a file or directory tree
    Rm { image: PathBuf, path: String },
    /// Create a directory
    Mkdir { image: PathBuf, path: String },
    /// Verify checksums and structure
    Fsck {
        image: PathBuf,
        /// Collect unreachable entries and rewrite the image
        #[arg(long)]
        repair: bool,
    },
}

fn open_partial(args: &Args, image: &PathBuf, charset: Charset) -> Result<PartialDom> {
    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    PartialDom::open(image, config, charset).with_context(|| format!("opening {}", image.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cs = if args.latin1 {
        Charset::Latin1
    } else {
        Charset::Utf8
    };

    match &args.command {
        Command::New {
            image,
            capacity,
            name,
        } => {
            if image.exists() {
                bail!("{} already exists", image.display());
            }
            VirtualDisk::new(*capacity, name, cs)?.write_to_file(image)?;
            info!("Created {} ({} bytes, '{}')", image.display(), capacity, name);
        }

        Command::Info { image } => {
            let skimmer = DiskSkimmer::open(image)?;
            let header = skimmer.header();
            println!("name:       {}", skimmer.disk_name(cs));
            println!("version:    {}", header.version);
            println!("capacity:   {}", skimmer.capacity());
            println!("used:       {}", skimmer.used_bytes());
            println!("entries:    {}", skimmer.len());
            println!("read-only:  {}", skimmer.is_read_only());
            println!("disk crc:   {:08X}", header.crc);
        }

        Command::Ls { image, path } => {
            let mut dom = open_partial(&args, image, cs)?;
            let dir = dom
                .peek_path(path)?
                .with_context(|| format!("{}: no such path", path))?;
            let mut listing = dom.list_dir(dir.entry_id)?;
            listing.sort_by_key(|e| e.filename(cs));
            for entry in listing {
                let (kind, size) = match &entry.contents {
                    EntryContent::File(bytes) => ('-', bytes.len()),
                    EntryContent::Directory(children) => ('d', children.len() as u64),
                    EntryContent::Symlink(_) => ('l', 0),
                };
                println!(
                    "{} {:>10} {:>10}  {}",
                    kind,
                    size,
                    entry.entry_id,
                    entry.filename(cs)
                );
            }
        }

        Command::Cat { image, path } => {
            let disk = VirtualDisk::read_from_file(image, CrcLevel::Warn)?;
            let entry = disk
                .find(path, cs)
                .with_context(|| format!("{}: no such path", path))?;
            let target = disk.resolve_if_symlink(entry.entry_id, true)?;
            let bytes = target
                .file_bytes()
                .with_context(|| format!("{}: not a file", path))?;
            let mut stdout = std::io::stdout().lock();
            bytes.write_to(&mut stdout)?;
            stdout.flush()?;
        }

        Command::Put {
            image,
            source,
            path,
            force,
        } => {
            let bytes = ByteArray64::from_file(source)
                .with_context(|| format!("reading {}", source.display()))?;
            let mut skimmer = DiskSkimmer::open(image)?;
            let id = skimmer.create_new_file(path, bytes, *force, cs)?;
            info!("Stored {} as entry {}", path, id);
        }

        Command::Rm { image, path } => {
            let mut dom = open_partial(&args, image, cs)?;
            let id = dom
                .index()
                .find(path)
                .with_context(|| format!("{}: no such path", path))?;
            dom.remove_file(id)?;
            dom.commit()?;
        }

        Command::Mkdir { image, path } => {
            let mut dom = open_partial(&args, image, cs)?;
            let id = dom.add_new_dir(path, cs)?;
            dom.commit()?;
            info!("Created directory {} as entry {}", path, id);
        }

        Command::Fsck { image, repair } => {
            match recover_interrupted_rewrite(image)? {
                Recovery::Clean => {}
                Recovery::RestoredBackup => warn!("Restored {} from backup", image.display()),
                Recovery::RemovedLeftovers => warn!("Removed stale rewrite files"),
            }

            let mut mismatches = Vec::new();
            let bytes = ByteArray64::from_file(image)?;
            let mut disk =
                VirtualDisk::deserialize(&bytes, CrcLevel::Warn, &mut |m| mismatches.push(*m))?;
            let orphans = disk.gc_search_orphan();
            let phantoms = disk.gc_search_phantom_baby();

            println!("entries:          {}", disk.len());
            println!("crc mismatches:   {}", mismatches.len());
            println!("orphans:          {}", orphans.len());
            println!("phantom children: {}", phantoms.len());

            if *repair && (!orphans.is_empty() || !phantoms.is_empty() || !mismatches.is_empty()) {
                if disk.is_read_only() {
                    bail!("{} is read-only", image.display());
                }
                disk.gc_dump_all();
                disk.write_to_file(image)?;
                info!("Rewrote {} with {} entries", image.display(), disk.len());
            } else if !mismatches.is_empty() || !orphans.is_empty() || !phantoms.is_empty() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
