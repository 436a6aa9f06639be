use serde::Deserialize;

use crate::{
    error::{FsError, FsResult},
    FD_START, MAX_PATH, NR_OPEN_FILES,
};

/// Tunables of the POSIX layer.
///
/// Every field has a default, so a JSON document only needs to carry the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Capacity of the file descriptor table.
    pub nr_open_files: usize,
    /// Base added to table indices before they are handed to callers, so they
    /// never collide with descriptors owned by the host kernel.
    pub fd_start: i32,
    /// Upper bound, in bytes, of every composed path and of the working directory.
    pub max_path: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            nr_open_files: NR_OPEN_FILES,
            fd_start: FD_START,
            max_path: MAX_PATH,
        }
    }
}

impl FsConfig {
    pub fn from_json(data: &[u8]) -> FsResult<Self> {
        let config: FsConfig = serde_json::from_slice(data).map_err(|e| {
            log::error!("invalid fs config: {}", e);
            FsError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.nr_open_files == 0 || self.fd_start < 0 || self.max_path < 2 {
            return Err(FsError::InvalidArgument);
        }
        // the largest exposed descriptor must still fit in an i32
        let span = i32::try_from(self.nr_open_files).map_err(|_| FsError::InvalidArgument)?;
        self.fd_start
            .checked_add(span)
            .map(|_| ())
            .ok_or(FsError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = FsConfig::from_json(br#"{ "nr_open_files": 8 }"#).unwrap();
        assert_eq!(config.nr_open_files, 8);
        assert_eq!(config.fd_start, FD_START);
        assert_eq!(config.max_path, MAX_PATH);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            FsConfig::from_json(br#"{ "nr_open_files": 0 }"#),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            FsConfig::from_json(br#"{ "fd_start": -1 }"#),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            FsConfig::from_json(br#"{ "fd_start": 2147483647 }"#),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(FsConfig::from_json(b"not json"), Err(FsError::InvalidArgument));
    }
}
