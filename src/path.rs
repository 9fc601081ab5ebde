use crate::MonitorError;
use crate::constants::MAX_PATH_LENGTH;

/// A daemon-assigned object path wrapper for type safety
///
/// Paths are stable, opaque identifiers chosen by the Bluetooth daemon. They
/// key every entity in the registry; cross-references between entities are
/// expressed as paths and resolved through lookups, never as ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectPath(heapless::String<MAX_PATH_LENGTH>);

impl ObjectPath {
    /// Create an object path from a string slice
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::InvalidParameter` if the string exceeds
    /// `MAX_PATH_LENGTH` bytes.
    pub fn new(path: &str) -> Result<Self, MonitorError> {
        heapless::String::try_from(path)
            .map(Self)
            .map_err(|()| MonitorError::InvalidParameter)
    }

    /// View the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether the path is empty (never true for daemon-assigned paths)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = MonitorError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        ObjectPath::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_creation() {
        let path = ObjectPath::new("/org/bluez/hci0/dev_12_34_56_78_9A_BC").unwrap();
        assert_eq!(path.as_str(), "/org/bluez/hci0/dev_12_34_56_78_9A_BC");
        assert!(!path.is_empty());
    }

    #[test]
    fn test_object_path_length_limit() {
        let long = "/org/bluez/hci0/dev_12_34_56_78_9A_BC/sep1/fd0/overflowing_far_beyond_capacity";
        assert!(long.len() > MAX_PATH_LENGTH);
        assert_eq!(
            ObjectPath::new(long),
            Err(MonitorError::InvalidParameter)
        );
    }

    #[test]
    fn test_object_path_equality() {
        let a = ObjectPath::new("/org/bluez/hci0").unwrap();
        let b: ObjectPath = "/org/bluez/hci0".try_into().unwrap();
        let c = ObjectPath::new("/org/bluez/hci1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
