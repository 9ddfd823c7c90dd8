use std::{collections::HashMap, net::SocketAddr, path::PathBuf, str::FromStr};

/// Worker configuration loaded from environment variables.
///
/// Pipeline tuning (`TKG_*`, `OPENAI_API_KEY`) is read separately by
/// `tkg_ingest::PipelineConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for `.txt` and `.md` documents. Env: `INPUT_PATH`, default `./inbox`.
    pub input_path: PathBuf,
    /// Address to bind the HTTP server. Env: `BIND_ADDR`, default `0.0.0.0:8080`.
    pub bind_addr: SocketAddr,
    /// Files larger than this are skipped. Env: `MAX_FILE_SIZE`, default 10 MB.
    pub max_file_size: usize,
    /// Stop the process once the initial batch is ingested. Env: `EXIT_WHEN_IDLE`, default false.
    pub exit_when_idle: bool,
}

impl Config {
    /// Load configuration from environment variables, applying defaults.
    ///
    /// Variables missing from the process environment are taken from a
    /// `.env` file in the working directory (or a parent) when one exists.
    ///
    /// # Errors
    /// Returns an error if `BIND_ADDR` is not a valid socket address or a
    /// numeric/boolean variable cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = dotenvy::dotenv_iter()
            .map(|entries| entries.filter_map(Result::ok).collect())
            .unwrap_or_default();
        Self::from_lookup(env_then_file(|name| std::env::var(name).ok(), file))
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let input_path = PathBuf::from(lookup("INPUT_PATH").unwrap_or_else(|| "./inbox".to_string()));

        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_addr = SocketAddr::from_str(&bind_addr)
            .map_err(|e| anyhow::anyhow!("Invalid BIND_ADDR '{}': {}", bind_addr, e))?;

        let max_file_size = parse_var(&lookup, "MAX_FILE_SIZE", 10 * 1024 * 1024)?;
        let exit_when_idle = parse_var(&lookup, "EXIT_WHEN_IDLE", false)?;

        Ok(Config {
            input_path,
            bind_addr,
            max_file_size,
            exit_when_idle,
        })
    }

    /// Check that the input path is a readable directory and canonicalize it.
    pub async fn validate_input(&mut self) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(&self.input_path).await.map_err(|e| {
            anyhow::anyhow!(
                "Cannot access input path '{}': {}",
                self.input_path.display(),
                e
            )
        })?;

        if !meta.is_dir() {
            anyhow::bail!("Input path is not a directory: {}", self.input_path.display());
        }

        self.input_path = tokio::fs::canonicalize(&self.input_path).await.map_err(|e| {
            anyhow::anyhow!(
                "Cannot canonicalize input path '{}': {}",
                self.input_path.display(),
                e
            )
        })?;
        Ok(())
    }
}

/// Look `name` up in `env` first and fall back to the `.env` entries.
fn env_then_file<F>(env: F, file: HashMap<String, String>) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |name| env(name).or_else(|| file.get(name).cloned())
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn read_env_file(path: &std::path::Path) -> HashMap<String, String> {
        dotenvy::from_path_iter(path)
            .unwrap()
            .filter_map(Result::ok)
            .collect()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.input_path, PathBuf::from("./inbox"));
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert!(!config.exit_when_idle);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = Config::from_lookup(lookup(&[("BIND_ADDR", "nowhere")])).unwrap_err();
        assert!(err.to_string().contains("BIND_ADDR"));
        let err = Config::from_lookup(lookup(&[("MAX_FILE_SIZE", "big")])).unwrap_err();
        assert!(err.to_string().contains("MAX_FILE_SIZE"));
    }

    #[test]
    fn dotenv_entries_fill_in_for_unset_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "INPUT_PATH=/data/inbox\nMAX_FILE_SIZE=2048\nEXIT_WHEN_IDLE=true\nTKG_WORKERS_PER_STAGE=3\n",
        )
        .unwrap();
        let file = read_env_file(&path);

        let config = Config::from_lookup(env_then_file(lookup(&[]), file.clone())).unwrap();
        assert_eq!(config.input_path, PathBuf::from("/data/inbox"));
        assert_eq!(config.max_file_size, 2048);
        assert!(config.exit_when_idle);

        let env = lookup(&[("MAX_FILE_SIZE", "4096")]);
        let config = Config::from_lookup(env_then_file(env, file)).unwrap();
        assert_eq!(config.max_file_size, 4096, "process environment wins");
        assert_eq!(config.input_path, PathBuf::from("/data/inbox"));
    }

    #[tokio::test]
    async fn input_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.txt");
        std::fs::write(&file, "x").unwrap();

        let mut config = Config::from_lookup(lookup(&[("INPUT_PATH", file.to_str().unwrap())])).unwrap();
        assert!(config.validate_input().await.is_err());

        let mut config =
            Config::from_lookup(lookup(&[("INPUT_PATH", dir.path().to_str().unwrap())])).unwrap();
        config.validate_input().await.unwrap();
        assert!(config.input_path.is_absolute());
    }
}
