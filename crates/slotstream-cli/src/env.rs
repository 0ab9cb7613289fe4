use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// The dotenv file for an environment: `.env`, or `.env.{name}` when one is given.
pub fn env_file_name(env: Option<&str>) -> String {
    match env {
        Some(name) => format!(".env.{}", name),
        None => ".env".to_string(),
    }
}

/// Load `file_name` from the current directory or the closest ancestor that has one.
///
/// Returns the loaded path, or `None` if no directory up to the filesystem
/// root contains the file.
pub fn load_dotenv_from_ancestors(file_name: &str) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    for dir in cwd.ancestors() {
        let env_path = dir.join(file_name);
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("Failed to load {}", env_path.display()))?;
            info!("Loaded {}", env_path.display());
            return Ok(Some(env_path));
        }
    }

    debug!(file = %file_name, "No dotenv file found");
    Ok(None)
}

/// Load the dotenv file for `env`.
///
/// A missing `.env` is fine since variables may come from the process
/// environment, but an explicitly named environment must exist.
pub fn load_env(env: Option<&str>) -> Result<()> {
    let file_name = env_file_name(env);
    let loaded = load_dotenv_from_ancestors(&file_name)?;

    if loaded.is_none() && env.is_some() {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        anyhow::bail!(
            "No {} file found.\n\n\
            Searched from {} to filesystem root.",
            file_name,
            cwd.display()
        );
    }

    Ok(())
}
