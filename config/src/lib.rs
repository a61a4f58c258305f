pub mod paths;
pub mod registry;
pub mod settings;

pub use paths::PathManager;
pub use registry::{ModelEntry, ModelProps, ModelRegistry, Props};
pub use settings::Settings;

use std::path::PathBuf;

/// Load environment variables from .env files.
/// `./.env` is read before `~/.env`; dotenv never overwrites a variable that
/// is already set, so the project file and the real environment win.
/// Call this before parsing CLI args to ensure env vars are available.
pub fn load_env_file() {
    load_env_paths(env_file_candidates());
}

/// `.env` files in precedence order: project directory, then home directory
fn env_file_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".env")];
    if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
        paths.push(home.join(".env"));
    }
    paths
}

fn load_env_paths(paths: impl IntoIterator<Item = PathBuf>) {
    for path in paths {
        if path.exists() {
            if let Err(e) = dotenv::from_path(&path) {
                tracing::warn!("ignoring {}: {}", path.display(), e);
            }
        }
    }
}
