use eyre::Context as _;
use rand::Rng as _;
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

pub fn ensure_dir(dir: &Path) -> eyre::Result<()> {
    if dir.exists() {
        if is_symlink(dir)? {
            eyre::bail!("refusing to use symlinked directory: {}", dir.display());
        }
        let md = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
        if !md.is_dir() {
            eyre::bail!("expected directory at {}", dir.display());
        }
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))
}

fn tmp_path_for(parent: &Path, final_name: &Path) -> PathBuf {
    let base = final_name
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut rand_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut rand_bytes);
    let suffix = hex::encode(rand_bytes);
    parent.join(format!(".{base}.tmp.{suffix}"))
}

/// Write `bytes` to `path` so that readers only ever observe the old or the new contents.
///
/// The data goes to a uniquely named sibling temp file which is fsynced and then renamed over
/// the destination. A failed write removes the temp file and leaves the destination untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_dir(parent)?;

    if path.exists() && is_symlink(path)? {
        eyre::bail!("refusing to write to symlink: {}", path.display());
    }

    let tmp = tmp_path_for(parent, path);
    let res = write_and_rename(&tmp, path, bytes);
    if res.is_err() {
        drop(fs::remove_file(&tmp));
    }
    res
}

fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;

    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush()
        .with_context(|| format!("flush {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    // `rename` is atomic on Unix. On Windows, this can fail if the destination exists.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }

    fs::rename(tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn write_string_atomic(path: &Path, s: &str) -> eyre::Result<()> {
    write_atomic(path, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp_files() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let p = td.path().join("nested").join("state.json");

        write_string_atomic(&p, "{\"a\":1}")?;
        write_string_atomic(&p, "{\"a\":2}")?;

        let got = fs::read_to_string(&p).context("read back")?;
        assert_eq!(got, "{\"a\":2}");

        let leftovers = fs::read_dir(td.path().join("nested"))
            .context("list dir")?
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0, "temp files should be renamed away");
        Ok(())
    }

    #[test]
    fn ensure_dir_rejects_regular_file() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let p = td.path().join("not-a-dir");
        fs::write(&p, b"x").context("write file")?;
        assert!(ensure_dir(&p).is_err(), "a regular file is not a directory");
        Ok(())
    }
}
