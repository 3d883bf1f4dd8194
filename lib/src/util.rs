use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Pick `/data/<file_name>` when that directory exists and is writable
/// (the add-on container layout), falling back to the working directory
/// for local runs.
pub fn default_store_path(file_name: &str) -> PathBuf {
    let data = Path::new("/data");
    if data.is_dir() && fs_writable(data) {
        data.join(file_name)
    } else {
        PathBuf::from(file_name)
    }
}

fn fs_writable(dir: &Path) -> bool {
    std::fs::metadata(dir).is_ok_and(|m| !m.permissions().readonly())
}

/// Serialize to pretty JSON and replace the target atomically via a
/// sibling temp file, so a crash mid-write can't corrupt the store.
pub async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), tokio::io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".new");
    let tmp_path = PathBuf::from(tmp_path);

    let contents = serde_json::to_vec_pretty(value).expect("store values serialize");
    let mut tmp_file = File::create(&tmp_path).await?;
    tmp_file.write_all(&contents).await?;
    tmp_file.flush().await?;
    fs::rename(&tmp_path, path).await
}
