//! `mkfs-ext4`: builds an ext4 filesystem image from a source directory
//! tree, writing either a flat image or an Android sparse image, the way
//! `make_ext4fs` does.

use ext4fs::diag;
use ext4fs::error::{Error, Result};
use ext4fs::fsconfig::FsConfigTable;
use ext4fs::source::{DirSource, SourceKind};
use ext4fs::{disk, Engine, FsInfo};
use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const BIN: &str = "mkfs-ext4";

/// Fixed namespace used to derive a UUID5 from the volume label, the way
/// `uuid5_generate("extandroid/make_ext4fs", label)` did.
const UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x4d, 0x61, 0x65, 0x73, 0x74, 0x72, 0x6f, 0x2f, 0x6d, 0x6b, 0x66, 0x73, 0x2d, 0x65, 0x34,
]);

fn usage(path: &str) {
    eprintln!("{path} [ -l <len> ] [ -j <journal size> ] [ -b <block_size> ]");
    eprintln!("    [ -g <blocks per group> ] [ -i <inodes> ] [ -I <inode size> ]");
    eprintln!("    [ -m <reserved blocks percent> ] [ -L <label> ] [ -u <uuid>] [ -f ]");
    eprintln!("    [ -C fs_config ] [ -T timestamp ]");
    eprintln!("    [ -z | -s ] [ -w ] [ -c ] [ -J ] [ -v ] [ -B <block_list_file> ]");
    eprintln!("    <filename> [<directory>]");
}

/// Parses a size argument with an optional `k`/`m`/`g` (case-insensitive)
/// suffix, mirroring `parse_num`.
fn parse_num(arg: &str) -> Option<u64> {
    let lower = arg.to_ascii_lowercase();
    let (digits, mult) = if let Some(d) = lower.strip_suffix('k') {
        (d, 1024u64)
    } else if let Some(d) = lower.strip_suffix('m') {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix('g') {
        (d, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.parse::<u64>().ok().map(|n| n * mult)
}

fn parse_uuid(arg: &str) -> Option<[u8; 16]> {
    Uuid::parse_str(arg).ok().map(|u| *u.as_bytes())
}

struct Options {
    filename: String,
    directory: Option<String>,
    info: FsInfo,
    no_journal: bool,
    uuid_user_specified: bool,
    gzip: bool,
    sparse: bool,
    crc: bool,
    wipe: bool,
    verbose: bool,
    fixed_time: Option<i64>,
    fs_config_file: Option<String>,
    block_list_file: Option<String>,
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().collect();
    let prog = args.first().cloned().unwrap_or_else(|| BIN.to_string());
    let mut info = FsInfo::default();
    let mut no_journal = false;
    let mut uuid_user_specified = false;
    let mut gzip = false;
    let mut sparse = false;
    let mut crc = false;
    let mut wipe = false;
    let mut verbose = false;
    let mut fixed_time = None;
    let mut fs_config_file = None;
    let mut block_list_file = None;

    let mut it = args.into_iter().skip(1).peekable();
    let mut positional = Vec::new();
    while let Some(arg) = it.next() {
        if !arg.starts_with('-') || arg == "-" {
            positional.push(arg);
            continue;
        }
        let mut take_value = || {
            it.next()
                .unwrap_or_else(|| diag::error(&prog, format!("option {arg} requires an argument")))
        };
        match arg.as_str() {
            "-l" => info.len = parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -l value")),
            "-j" => {
                info.journal_blocks =
                    parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -j value")) as u32
            }
            "-b" => info.block_size = parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -b value")),
            "-g" => {
                info.blocks_per_group =
                    parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -g value")) as u32
            }
            "-i" => info.inodes = parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -i value")) as u32,
            "-I" => {
                info.inode_size =
                    parse_num(&take_value()).unwrap_or_else(|| diag::error(&prog, "bad -I value")) as u16
            }
            "-L" => {
                let label = take_value();
                let bytes = label.as_bytes();
                let n = bytes.len().min(16);
                info.label[..n].copy_from_slice(&bytes[..n]);
            }
            "-u" => {
                let s = take_value();
                info.uuid = parse_uuid(&s).unwrap_or_else(|| diag::error(&prog, format!("failed to parse UUID: '{s}'")));
                uuid_user_specified = true;
            }
            "-T" => {
                let s = take_value();
                fixed_time = Some(s.parse::<i64>().unwrap_or_else(|_| diag::error(&prog, "bad -T value")));
            }
            "-C" => fs_config_file = Some(take_value()),
            "-B" => block_list_file = Some(take_value()),
            "-m" => {
                info.reserve_pcnt =
                    take_value().parse().unwrap_or_else(|_| diag::error(&prog, "bad -m value"))
            }
            "-f" => info.force = true,
            "-w" => wipe = true,
            "-z" => gzip = true,
            "-J" => no_journal = true,
            "-c" => crc = true,
            "-s" => sparse = true,
            "-v" => verbose = true,
            _ => {
                usage(&prog);
                diag::error(&prog, format!("unrecognized option '{arg}'"));
            }
        }
    }

    if let Some(file_config) = &fs_config_file {
        if !Path::new(file_config).exists() {
            diag::error(&prog, format!("failed to load {file_config}"));
        }
    }

    if wipe && sparse {
        usage(&prog);
        diag::error(&prog, "Cannot specify both wipe and sparse");
    }
    if wipe && gzip {
        usage(&prog);
        diag::error(&prog, "Cannot specify both wipe and gzip");
    }

    if positional.is_empty() {
        usage(&prog);
        diag::error(&prog, "Expected filename after options");
    }
    let mut positional = positional.into_iter();
    let filename = positional.next().unwrap();
    let directory = positional.next();
    if let Some(extra) = positional.next() {
        usage(&prog);
        diag::error(&prog, format!("Unexpected argument: {extra}"));
    }

    Options {
        filename,
        directory,
        info,
        no_journal,
        uuid_user_specified,
        gzip,
        sparse,
        crc,
        wipe,
        verbose,
        fixed_time,
        fs_config_file,
        block_list_file,
    }
}

/// A `DirSource` backed by a real directory on the host filesystem.
struct HostDirSource {
    name: String,
    relative_path: String,
    path: PathBuf,
    kind: SourceKind,
    len: u64,
    target: Option<Vec<u8>>,
    rdev: Option<(u32, u32)>,
}

impl HostDirSource {
    fn from_root(root: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(root).map_err(Error::Host)?;
        Ok(Self {
            name: String::new(),
            relative_path: String::new(),
            path: root.to_path_buf(),
            kind: kind_of(&meta),
            len: meta.len(),
            target: None,
            rdev: None,
        })
    }

    fn child(parent_relative: &str, path: PathBuf) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative_path = if parent_relative.is_empty() {
            name.clone()
        } else {
            format!("{parent_relative}/{name}")
        };
        let meta = fs::symlink_metadata(&path).map_err(Error::Host)?;
        let kind = kind_of(&meta);
        let target = if kind == SourceKind::Symlink {
            Some(fs::read_link(&path).map_err(Error::Host)?.as_os_str().as_bytes().to_vec())
        } else {
            None
        };
        let rdev = if kind == SourceKind::CharDevice || kind == SourceKind::BlockDevice {
            let dev = meta.rdev();
            let major = unsafe { libc::major(dev) };
            let minor = unsafe { libc::minor(dev) };
            Some((major, minor))
        } else {
            None
        };
        Ok(Self {
            name,
            relative_path,
            path,
            kind,
            len: meta.len(),
            target,
            rdev,
        })
    }
}

fn kind_of(meta: &fs::Metadata) -> SourceKind {
    let t = meta.file_type();
    if t.is_dir() {
        SourceKind::Directory
    } else if t.is_symlink() {
        SourceKind::Symlink
    } else if t.is_char_device() {
        SourceKind::CharDevice
    } else if t.is_block_device() {
        SourceKind::BlockDevice
    } else if t.is_fifo() {
        SourceKind::Fifo
    } else if t.is_socket() {
        SourceKind::Socket
    } else {
        SourceKind::Regular
    }
}

impl DirSource for HostDirSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> &str {
        &self.relative_path
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn symlink_target(&self) -> Option<Vec<u8>> {
        self.target.clone()
    }

    fn rdev(&self) -> Option<(u32, u32)> {
        self.rdev
    }

    fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(Error::Host)
    }

    fn children(&self) -> Result<Vec<Box<dyn DirSource>>> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.path)
            .map_err(Error::Host)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(Error::Host)?;
        names.sort();
        names
            .into_iter()
            .map(|path| -> Result<Box<dyn DirSource>> {
                Ok(Box::new(HostDirSource::child(&self.relative_path, path)?))
            })
            .collect()
    }
}

fn wipe_device(path: &str) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; 4096];
    let size = disk::probe_device_size(&file)?;
    let mut remaining = size;
    let mut writer = BufWriter::new(&file);
    while remaining > 0 {
        let take = remaining.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..take])?;
        remaining -= take as u64;
    }
    writer.flush()
}

fn main() {
    let opts = parse_args();
    let prog = BIN;

    if opts.wipe {
        if let Err(e) = wipe_device(&opts.filename) {
            diag::error(prog, format!("failed to wipe {}: {e}", opts.filename));
        }
    }

    let mut info = opts.info;

    if info.len == 0 {
        let Ok(existing) = File::open(&opts.filename) else {
            usage(prog);
            diag::error(prog, "Need size of filesystem");
        };
        info.len = disk::probe_device_size(&existing).unwrap_or(0);
        if info.len == 0 {
            usage(prog);
            diag::error(prog, "Need size of filesystem");
        }
    }

    if info.block_size == 0 {
        info.block_size = FsInfo::compute_block_size();
    }
    if opts.no_journal {
        info.journal_blocks = 0;
    } else {
        info.feat_compat |= ext4fs::info::FEATURE_COMPAT_HAS_JOURNAL;
        if info.journal_blocks == 0 {
            info.journal_blocks = FsInfo::compute_journal_blocks(info.len, info.block_size.max(1024));
        }
    }

    if !opts.uuid_user_specified {
        let label_str = String::from_utf8_lossy(&info.label);
        let label_str = label_str.trim_end_matches('\0');
        info.uuid = *Uuid::new_v5(&UUID_NAMESPACE, label_str.as_bytes()).as_bytes();
    }

    let info = match info.finalize() {
        Ok(i) => i,
        Err(e) => diag::error(prog, e),
    };

    diag::verbose(opts.verbose, "Creating filesystem with parameters:");
    diag::verbose(opts.verbose, format!("    Size: {}", info.len));
    diag::verbose(opts.verbose, format!("    Block size: {}", info.block_size));
    diag::verbose(opts.verbose, format!("    Inode size: {}", info.inode_size));
    diag::verbose(opts.verbose, format!("    Journal blocks: {}", info.journal_blocks));

    let fixed_time = opts.fixed_time.map(|t| t as u32);
    let mkfs_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut engine = match Engine::new(info, mkfs_time) {
        Ok(e) => e,
        Err(e) => diag::error(prog, e),
    };
    engine.reserve_special_inodes();
    if let Err(e) = engine.create_journal_inode() {
        diag::error(prog, e);
    }
    if let Err(e) = engine.create_resize_inode() {
        diag::error(prog, e);
    }

    let cfg = match &opts.fs_config_file {
        Some(path) => match FsConfigTable::load(Path::new(path)) {
            Ok(t) => Some(t),
            Err(e) => diag::error(prog, e),
        },
        None => None,
    };

    if let Some(dir) = &opts.directory {
        let root = match HostDirSource::from_root(Path::new(dir)) {
            Ok(r) => r,
            Err(e) => diag::error(prog, e),
        };
        if let Err(e) = engine.build_tree(&root, cfg.as_ref(), fixed_time) {
            diag::error(prog, e);
        }
    } else if let Err(e) = engine.build_tree(&EmptyRoot, cfg.as_ref(), fixed_time) {
        diag::error(prog, e);
    }

    if let Err(e) = engine.finalize() {
        diag::error(prog, e);
    }

    if let Some(block_list_path) = &opts.block_list_file {
        if let Err(e) = write_block_list(block_list_path, &engine) {
            diag::error(prog, format!("failed to write block_list_file: {e}"));
        }
    }

    let result = write_image(&opts, &engine);
    if let Err(e) = result {
        if opts.filename != "-" {
            let _ = fs::remove_file(&opts.filename);
        }
        diag::error(prog, e);
    }
}

/// An empty `DirSource` tree, used when no source directory was given.
struct EmptyRoot;

impl DirSource for EmptyRoot {
    fn name(&self) -> &str {
        ""
    }

    fn relative_path(&self) -> &str {
        ""
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Directory
    }

    fn len(&self) -> u64 {
        0
    }

    fn symlink_target(&self) -> Option<Vec<u8>> {
        None
    }

    fn rdev(&self) -> Option<(u32, u32)> {
        None
    }

    fn open(&self) -> Result<File> {
        unreachable!("EmptyRoot is always a directory")
    }

    fn children(&self) -> Result<Vec<Box<dyn DirSource>>> {
        Ok(Vec::new())
    }
}

fn write_block_list(path: &str, engine: &Engine) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (rel_path, start, len) in engine.block_reports() {
        let end = start + *len as u64 - 1;
        writeln!(out, "{rel_path} {start}-{end}")?;
    }
    out.flush()
}

fn write_image(opts: &Options, engine: &Engine) -> Result<()> {
    if opts.filename == "-" {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        write_with_gzip(&mut out, opts, engine)
    } else {
        let file = File::create(&opts.filename).map_err(Error::Io)?;
        let mut out = BufWriter::new(file);
        write_with_gzip(&mut out, opts, engine)
    }
}

fn write_with_gzip(out: &mut dyn Write, opts: &Options, engine: &Engine) -> Result<()> {
    if opts.gzip {
        let mut encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
        engine.write_to(&mut encoder, opts.sparse, opts.crc)?;
        encoder.finish().map_err(Error::Io)?;
        Ok(())
    } else {
        engine.write_to(out, opts.sparse, opts.crc)
    }
}
