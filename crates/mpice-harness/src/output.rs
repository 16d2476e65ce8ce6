//! Run folder bookkeeping and log post-processing.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

/// Marker the ICE agent logs once per nominated candidate pair.
pub const NOMINATION_MARKER: &str = "NominatedPair:";

/// More nominations than this means ICE found its paths.
pub const NOMINATION_THRESHOLD: usize = 2;

const DIR_MODE: u32 = 0o777;
const FILE_MODE: u32 = 0o666;

/// Create `<root>/<YYYY-MM-DD_HH-MM>`, appending `_1`, `_2`, … when a run
/// from the same minute already exists.
pub fn create_run_dir<Tz: TimeZone>(root: &Path, now: &DateTime<Tz>) -> io::Result<PathBuf>
where
    Tz::Offset: std::fmt::Display,
{
    fs::create_dir_all(root)?;
    let stamp = now.format("%Y-%m-%d_%H-%M").to_string();
    let mut candidate = root.join(&stamp);
    let mut suffix = 0;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => {
                tracing::info!(path = %candidate.display(), "created run folder");
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                suffix += 1;
                candidate = root.join(format!("{stamp}_{suffix}"));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open up a run folder for the unprivileged user once a root-owned run
/// finishes: directories 0o777, files 0o666. Returns the number of entries
/// changed.
pub fn loosen_permissions(dir: &Path) -> io::Result<usize> {
    let mut changed = 0;
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
    changed += 1;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            changed += loosen_permissions(&path)?;
        } else if meta.is_file() {
            fs::set_permissions(&path, fs::Permissions::from_mode(FILE_MODE))?;
            changed += 1;
        }
    }
    Ok(changed)
}

pub fn make_world_writable(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Keep lines containing any needle.
    Positive,
    /// Keep lines containing none of the needles.
    Negative,
}

impl FilterMode {
    fn prefix(self) -> &'static str {
        match self {
            FilterMode::Positive => "pos_filtered_",
            FilterMode::Negative => "neg_filtered_",
        }
    }
}

/// Write the lines of `path` selected by `needles` next to it, as
/// `pos_filtered_<name>` or `neg_filtered_<name>`. Needles are compared
/// against the lowercased line.
pub fn filter_log(path: &Path, needles: &[String], mode: FilterMode) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"))?
        .to_string_lossy();
    let out_path = path.with_file_name(format!("{}{name}", mode.prefix()));

    let reader = BufReader::new(File::open(path)?);
    let mut writer = BufWriter::new(File::create(&out_path)?);
    let mut kept = 0usize;
    for line in reader.split(b'\n') {
        let line = line?;
        let lower = String::from_utf8_lossy(&line).to_lowercase();
        let hit = needles.iter().any(|n| lower.contains(n.as_str()));
        if hit == (mode == FilterMode::Positive) {
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
            kept += 1;
        }
    }
    writer.flush()?;
    tracing::info!(path = %out_path.display(), lines = kept, "wrote filtered log");
    Ok(out_path)
}

/// Occurrences of [`NOMINATION_MARKER`] in a log file.
pub fn count_nominations(path: &Path) -> io::Result<usize> {
    let content = fs::read(path)?;
    let text = String::from_utf8_lossy(&content);
    Ok(text.matches(NOMINATION_MARKER).count())
}
