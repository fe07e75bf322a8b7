use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;

/// Fallback race passage when neither the host nor the pool provides one.
pub const DEFAULT_PASSAGE: &str =
    "The quick brown fox jumps over the lazy dog. Pack my box with five dozen liquor jugs.";

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).expect("Failed to create config directory");
    }

    let passages_path = config_path("passages.json");
    if !passages_path.exists() {
        let defaults = serde_json::json!([
            DEFAULT_PASSAGE,
            "Sphinx of black quartz, judge my vow. How vexingly quick daft zebras jump.",
            "Typing fast is easy; typing fast and accurately is the whole game.",
        ]);
        fs::write(
            &passages_path,
            serde_json::to_string_pretty(&defaults).unwrap(),
        )
        .expect("Failed to write default passages.json");
    }
}

/// Pool of race passages a host can draw from when not supplying a text.
pub struct PassagePool {
    passages: Vec<String>,
}

impl PassagePool {
    pub fn from_passages(passages: Vec<String>) -> Self {
        Self { passages }
    }

    /// Picks one passage at random, falling back to the built-in default
    /// when the pool is empty.
    pub fn pick(&self) -> String {
        if self.passages.is_empty() {
            return DEFAULT_PASSAGE.to_string();
        }
        let mut rng = rand::rng();
        self.passages[rng.random_range(0..self.passages.len())].clone()
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Load the passage pool from the config directory.
pub fn load_passages() -> PassagePool {
    let path = config_path("passages.json");
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            return PassagePool::from_passages(vec![DEFAULT_PASSAGE.to_string()]);
        }
    };

    match serde_json::from_str::<Vec<String>>(&data) {
        Ok(passages) => {
            let passages: Vec<String> =
                passages.into_iter().filter(|p| !p.trim().is_empty()).collect();
            if passages.is_empty() {
                PassagePool::from_passages(vec![DEFAULT_PASSAGE.to_string()])
            } else {
                PassagePool::from_passages(passages)
            }
        }
        Err(e) => {
            tracing::error!("Failed to parse {}: {}", path.display(), e);
            PassagePool::from_passages(vec![DEFAULT_PASSAGE.to_string()])
        }
    }
}
