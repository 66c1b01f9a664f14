use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Headroom demanded when bytes cross from one backend to another.
pub const CROSS_BACKEND_FACTOR: f64 = 1.05;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error(
        "not enough free space on disk, required: {}, available: {}",
        format_bytes(*required),
        format_bytes(*available)
    )]
    Insufficient { required: u64, available: u64 },
    #[error("target disk usage has reached {used_percent}%, above the {ceiling}% limit; free some space first")]
    UsageCeiling { used_percent: u8, ceiling: u8 },
    #[error("failed to query free space of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Pure capacity rule: `available` must cover `required * factor`.
pub fn check_space(available: u64, required: u64, factor: f64) -> Result<(), SpaceError> {
    let needed = (required as f64 * factor).ceil() as u64;
    if available < needed {
        return Err(SpaceError::Insufficient {
            required: needed,
            available,
        });
    }
    Ok(())
}

/// Checks the filesystem holding `dest` (or its nearest existing ancestor)
/// and returns the free byte count.
pub fn check_disk_space(dest: &Path, required: u64, same_backend: bool) -> Result<u64, SpaceError> {
    let anchor = existing_ancestor(dest);
    let available = fs2::available_space(&anchor).map_err(|source| SpaceError::Io {
        path: anchor.clone(),
        source,
    })?;
    let factor = if same_backend { 1.0 } else { CROSS_BACKEND_FACTOR };
    check_space(available, required, factor)?;
    Ok(available)
}

/// Refuses destinations whose filesystem is already fuller than `ceiling`.
pub fn check_usage_ceiling(dest: &Path, ceiling: Option<u8>) -> Result<(), SpaceError> {
    let Some(ceiling) = ceiling else {
        return Ok(());
    };
    let anchor = existing_ancestor(dest);
    let io_err = |source| SpaceError::Io {
        path: anchor.clone(),
        source,
    };
    let total = fs2::total_space(&anchor).map_err(io_err)?;
    let available = fs2::available_space(&anchor).map_err(io_err)?;
    let used_percent = used_percent(total, available);
    if used_percent > ceiling {
        return Err(SpaceError::UsageCeiling {
            used_percent,
            ceiling,
        });
    }
    Ok(())
}

fn used_percent(total: u64, available: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let used = total.saturating_sub(available) as u128;
    (used * 100).div_ceil(total as u128).min(100) as u8
}

fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("/"),
        }
    }
}

/// Human readable size with binary units, e.g. `1.2 GB` or `800 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.0} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn rejects_when_margin_is_not_covered() {
        assert!(check_space(105 * MIB, 100 * MIB, CROSS_BACKEND_FACTOR).is_ok());
        let err = check_space(104 * MIB, 100 * MIB, CROSS_BACKEND_FACTOR).unwrap_err();
        assert!(matches!(err, SpaceError::Insufficient { .. }));
        assert!(check_space(100 * MIB, 100 * MIB, 1.0).is_ok());
    }

    #[test]
    fn zero_sized_transfers_always_fit() {
        assert!(check_space(0, 0, CROSS_BACKEND_FACTOR).is_ok());
    }

    #[test]
    fn message_uses_readable_units() {
        let err = check_space(800 * MIB, 1229 * MIB, 1.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "not enough free space on disk, required: 1.2 GB, available: 800 MB"
        );
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(800 * MIB), "800 MB");
    }

    #[test]
    fn computes_used_percentage() {
        assert_eq!(used_percent(100, 40), 60);
        assert_eq!(used_percent(0, 0), 0);
        assert_eq!(used_percent(1000, 999), 1);
    }

    #[test]
    fn missing_destination_falls_back_to_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        assert_eq!(existing_ancestor(&nested), dir.path());
        assert!(check_disk_space(&nested, 1, false).is_ok());
        assert!(check_usage_ceiling(&nested, None).is_ok());
        assert!(check_usage_ceiling(&nested, Some(100)).is_ok());
    }
}
