//! Error types for the content cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Io(Box<std::io::Error>),
    EntryTooLarge { size: u64, capacity: u64 },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::EntryTooLarge { size, capacity } => {
                write!(f, "Entry too large: {} bytes exceeds cache capacity {}", size, capacity)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = CacheError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "access denied",
        ));
        assert!(format!("{}", err).contains("access denied"));
    }

    #[test]
    fn test_entry_too_large_display() {
        let err = CacheError::EntryTooLarge {
            size: 2048,
            capacity: 1024,
        };
        assert_eq!(
            format!("{}", err),
            "Entry too large: 2048 bytes exceeds cache capacity 1024"
        );
    }

    #[test]
    fn test_io_error_source() {
        let err = CacheError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_is_debug() {
        let err = CacheError::EntryTooLarge {
            size: 1,
            capacity: 0,
        };
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("EntryTooLarge"));
    }
}
