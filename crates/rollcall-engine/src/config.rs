use std::path::PathBuf;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the face database and attendance store.
    pub data_dir: PathBuf,
    /// Path to the serialized face database file.
    pub face_db_path: PathBuf,
    /// Path to the SQLite attendance database.
    pub attendance_db_path: PathBuf,
    /// Directory where resolved roster images are cached, keyed by student id.
    pub image_cache_dir: PathBuf,
    /// Similarity threshold for a confident match.
    pub similarity_threshold: f32,
    /// Side length of the descriptor normalization grid.
    pub normalize_size: u32,
    /// Timeout in seconds for fetching a remote roster image.
    pub fetch_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
            });

        let face_db_path = std::env::var("ROLLCALL_FACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces_db.json"));
        let attendance_db_path = std::env::var("ROLLCALL_ATTENDANCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));
        let image_cache_dir = std::env::var("ROLLCALL_IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("images"));

        Self {
            data_dir,
            face_db_path,
            attendance_db_path,
            image_cache_dir,
            similarity_threshold: env_f32(
                "ROLLCALL_SIMILARITY_THRESHOLD",
                rollcall_core::DEFAULT_THRESHOLD,
            ),
            normalize_size: env_u32(
                "ROLLCALL_NORMALIZE_SIZE",
                rollcall_core::DEFAULT_NORMALIZE_SIZE,
            ),
            fetch_timeout_secs: env_u64("ROLLCALL_FETCH_TIMEOUT_SECS", 30),
        }
    }

    /// Configuration rooted at an explicit data directory, using defaults
    /// for everything else. Used by tests and embedding callers.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            face_db_path: data_dir.join("faces_db.json"),
            attendance_db_path: data_dir.join("attendance.db"),
            image_cache_dir: data_dir.join("images"),
            similarity_threshold: rollcall_core::DEFAULT_THRESHOLD,
            normalize_size: rollcall_core::DEFAULT_NORMALIZE_SIZE,
            fetch_timeout_secs: 30,
            data_dir,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_data_dir_derives_paths() {
        let config = Config::with_data_dir("/tmp/rollcall-test");
        assert_eq!(config.face_db_path, PathBuf::from("/tmp/rollcall-test/faces_db.json"));
        assert_eq!(
            config.attendance_db_path,
            PathBuf::from("/tmp/rollcall-test/attendance.db")
        );
        assert_eq!(config.image_cache_dir, PathBuf::from("/tmp/rollcall-test/images"));
        assert_eq!(config.similarity_threshold, rollcall_core::DEFAULT_THRESHOLD);
        assert_eq!(config.normalize_size, rollcall_core::DEFAULT_NORMALIZE_SIZE);
    }
}
