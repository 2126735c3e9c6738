use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

/// One log per seed, so a failing seed can be rerun and diffed against its last run.
pub(crate) fn seed_log_path(dir: &Path, seed: u64) -> PathBuf {
    dir.join(format!("sim-seed-{seed}.log"))
}

/// Install the global subscriber. Output always goes to stdout and is teed
/// into the seed's log under `dir` when one is given.
pub(crate) fn init(dir: Option<&Path>, seed: u64) -> io::Result<Option<PathBuf>> {
    let (writer, path) = match dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = seed_log_path(dir, seed);
            let file = Arc::new(File::create(&path)?);
            (BoxMakeWriter::new(io::stdout.and(file)), Some(path))
        }
        None => (BoxMakeWriter::new(io::stdout), None),
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_name_carries_the_seed() {
        let path = seed_log_path(Path::new("runs"), 42);
        assert_eq!(path, Path::new("runs").join("sim-seed-42.log"));
    }
}
