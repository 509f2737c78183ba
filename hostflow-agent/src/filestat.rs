//! Per-path file I/O accounting.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Clone, Debug, Default, Serialize)]
pub struct FileStat {
    pub name: String,
    pub bytes: u64,
    pub time_ns: u64,
    pub open_count: u32,
    pub errors: u32,
}

#[derive(Default)]
pub struct FileStatTable {
    files: HashMap<String, FileStat>,
}

impl FileStatTable {
    pub fn get_or_create(&mut self, name: &str) -> &mut FileStat {
        self.files.entry(name.to_owned()).or_insert_with(|| FileStat {
            name: name.to_owned(),
            ..FileStat::default()
        })
    }

    pub fn find(&self, name: &str) -> Option<&FileStat> {
        self.files.get(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Hands the accumulated stats over to the flush and starts a fresh
    /// interval.
    pub fn drain(&mut self) -> Vec<FileStat> {
        self.files.drain().map(|(_, stat)| stat).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_per_path() {
        let mut table = FileStatTable::default();

        table.get_or_create("/var/log/syslog").bytes += 100;
        table.get_or_create("/var/log/syslog").bytes += 50;

        assert_eq!(table.len(), 1);
        assert_eq!(table.find("/var/log/syslog").map(|s| s.bytes), Some(150));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = FileStatTable::default();
        table.get_or_create("/etc/passwd").open_count += 1;

        let drained = table.drain();

        assert_eq!(drained.len(), 1);
        assert!(table.is_empty());
    }
}
