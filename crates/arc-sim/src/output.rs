use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Global JSONL file writer. Set once in main(), read by emit().
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// Build the JSONL output path, ensuring the directory exists.
/// Pattern: `<dir>/<scenario>_seed<seed>_<YYYYMMDD-HHMMSS>.jsonl`
pub fn resolve_jsonl_path(dir: &Path, scenario: &str, seed: u64) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(unique_path(dir, &format!("{scenario}_seed{seed}_{timestamp}"), "jsonl"))
}

/// First of `<base>.<ext>`, `<base>_2.<ext>`, ... that does not exist yet.
fn unique_path(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{base}.{ext}"));
    let mut n = 2u32;
    while candidate.exists() {
        candidate = dir.join(format!("{base}_{n}.{ext}"));
        n += 1;
    }
    candidate
}

/// Initialize the global JSONL file writer.
pub fn init_jsonl_writer(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "JSONL writer already set"))?;
    Ok(())
}

/// Write a JSONL line to the file (if initialized). Called from emit().
pub fn write_jsonl_line(line: &str) {
    if let Some(writer) = JSONL_WRITER.get() {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
    }
}
