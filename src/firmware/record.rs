use crate::config::{FIRMWARE_TITLE, FIRMWARE_VERSION};
use crate::line_store::{LineRecord, Lines};

/// Identity of the firmware installed by the last successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    pub title: String,
    pub version: String,
    /// Set once the new image has booted and announced itself.
    pub confirmed: bool,
}

impl FirmwareRecord {
    /// The identity compiled into this image, used when nothing was persisted.
    pub fn builtin() -> Self {
        Self {
            title: FIRMWARE_TITLE.to_string(),
            version: FIRMWARE_VERSION.to_string(),
            confirmed: true,
        }
    }

    pub fn installed(title: &str, version: &str) -> Self {
        Self {
            title: title.to_string(),
            version: version.to_string(),
            confirmed: false,
        }
    }
}

impl LineRecord for FirmwareRecord {
    const LINES: usize = 3;

    fn from_lines(lines: &Lines) -> Option<Self> {
        Some(Self {
            title: lines.get(0)?.to_string(),
            version: lines.get(1)?.to_string(),
            confirmed: lines.get(2) == Some("1"),
        })
    }

    fn to_lines(&self) -> Vec<String> {
        vec![
            self.title.clone(),
            self.version.clone(),
            if self.confirmed { "1" } else { "0" }.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_store::LineStore;

    #[test]
    fn incomplete_file_is_not_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("firmware.txt"));
        std::fs::write(store.path(), "sensor-node\n").unwrap();
        assert_eq!(store.load::<FirmwareRecord>().unwrap(), None);
    }

    #[test]
    fn unconfirmed_record_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("firmware.txt"));
        let record = FirmwareRecord::installed("sensor-node", "2.0.0");
        store.save(&record).unwrap();
        assert_eq!(store.load::<FirmwareRecord>().unwrap(), Some(record));
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "sensor-node\n2.0.0\n0\n");
    }
}
