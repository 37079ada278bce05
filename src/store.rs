use crate::messages::Address;
use anyhow::{anyhow, Context, Result};
use std::path::{Component, Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

/// Payload persistence for owned files.
///
/// A put copies `<source_dir>/<name>` into this node's private directory
/// `<data_dir>/<host>_<port>/<name>`, never overwriting an existing copy.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
    source_dir: PathBuf,
}

impl FileStore {
    pub async fn open(data_dir: &Path, source_dir: &Path, me: &Address) -> Result<Self> {
        let dir = data_dir.join(format!("{}_{}", me.host, me.port));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating node directory {}", dir.display()))?;
        Ok(Self {
            dir,
            source_dir: source_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(plain_name(name)?))
    }

    pub async fn persist(&self, name: &str) -> Result<()> {
        let name = plain_name(name)?;
        let source = self.source_dir.join(name);
        let content = fs::read_to_string(&source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;

        let target = self.dir.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
            .with_context(|| format!("creating {}", target.display()))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

// file names double as ring keys; only a single plain component may touch disk
fn plain_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(anyhow!("refusing to store {:?}: not a plain file name", name)),
    }
}
