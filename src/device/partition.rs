//! Partition table editing through sfdisk.
//!
//! Reads use `sfdisk --json`, edits go through `sfdisk --dump` scripts fed
//! back on stdin. The kernel refuses to reload a table whose partitions
//! are in use, so callers deactivate stacks before editing.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::common::cmd::{output_of, quiet_call, quiet_call_with_input};
use crate::common::errors::ConvertError;
use crate::common::progress::ProgressListener;
use crate::common::units::bytes_to_sectors;
use crate::device::BlockDevice;

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    firstlba: Option<u64>,
    sectorsize: u64,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    start: u64,
    size: u64,
}

/// The table of a whole disk, plus the number of the partition being
/// operated on.
pub struct PartitionTable {
    pub disk: BlockDevice,
    partno: u64,
}

impl PartitionTable {
    pub fn new(disk: BlockDevice, partno: u64) -> Result<Self> {
        Ok(PartitionTable { disk, partno })
    }

    fn read_table(&self) -> Result<SfdiskTable> {
        let json = output_of(&["sfdisk", "--json", self.disk_path()])?;
        let parsed: SfdiskOutput =
            serde_json::from_str(&json).context("parsing sfdisk --json output")?;
        Ok(parsed.partitiontable)
    }

    fn disk_path(&self) -> &str {
        self.disk.devpath.to_str().expect("device paths are ascii")
    }

    fn dump(&self) -> Result<String> {
        output_of(&["sfdisk", "--dump", self.disk_path()])
    }

    fn apply(&self, script: &str) -> Result<()> {
        quiet_call_with_input(&["sfdisk", "--", self.disk_path()], script)?;
        quiet_call(&["udevadm", "settle"])?;
        Ok(())
    }

    /// Refuse anything we can't safely rewrite: the bcache conversion
    /// moves a partition boundary, which is meaningless for logical
    /// (extended-MBR) partitions.
    pub fn check_shiftable(&self) -> Result<()> {
        let table = self.read_table()?;
        if table.label == "dos" && self.partno > 4 {
            return Err(ConvertError::UnsupportedLayout(
                "logical (extended-MBR) partitions cannot be shifted".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Verify there are `length` free bytes immediately before the
    /// partition starting at `part_start` (bytes).
    pub fn reserve_space_before(
        &self,
        part_start: u64,
        length: u64,
        progress: &dyn ProgressListener,
    ) -> Result<()> {
        self.check_shiftable()?;
        let table = self.read_table()?;
        let start_sector = part_start / table.sectorsize;
        let gap =
            free_gap_before(&table, start_sector).map(|sectors| sectors * table.sectorsize);

        match gap {
            Some(gap) if gap >= length => {
                progress.notify(&format!(
                    "Found {gap} bytes of free space before the partition"
                ));
                Ok(())
            }
            _ => Err(progress.bail(
                &format!(
                    "Need {length} free bytes immediately before the partition; \
                     shrink or move the preceding partition first"
                ),
                ConvertError::OverlappingPartition,
            )),
        }
    }

    /// Move the start of the partition from `part_start` to `part_start1`
    /// (bytes), growing it by the difference. The data is not moved; the
    /// caller has already written what belongs in the reclaimed gap.
    pub fn shift_left(&self, part_start: u64, part_start1: u64) -> Result<()> {
        anyhow::ensure!(part_start1 < part_start, "shift_left must move left");
        let dump = self.dump()?;
        let script = edit_dump_shift_left(
            &dump,
            bytes_to_sectors(part_start),
            bytes_to_sectors(part_start1),
        )?;
        self.apply(&script)
    }

    /// Resize the partition in place, keeping its start.
    pub fn part_resize(&self, part_start: u64, newsize: u64, shrink: bool) -> Result<()> {
        let table = self.read_table()?;
        let start_sector = part_start / table.sectorsize;
        let new_sectors = newsize.div_ceil(table.sectorsize);

        let old = table
            .partitions
            .iter()
            .find(|p| p.start == start_sector)
            .context("partition not found in the table")?;
        if shrink {
            anyhow::ensure!(new_sectors <= old.size, "refusing to grow during a shrink");
        } else {
            anyhow::ensure!(new_sectors >= old.size, "refusing to shrink during a grow");
        }

        let dump = self.dump()?;
        let script = edit_dump_resize(&dump, start_sector, new_sectors)?;
        self.apply(&script)
    }
}

/// Free sectors ending exactly at `start_sector`, if any.
fn free_gap_before(table: &SfdiskTable, start_sector: u64) -> Option<u64> {
    let first_lba = table
        .firstlba
        .or_else(|| table.partitions.iter().map(|p| p.start).min())
        .unwrap_or(0);

    let mut preceding_end = first_lba;
    for part in &table.partitions {
        let end = part.start + part.size;
        if end <= start_sector && end > preceding_end {
            preceding_end = end;
        }
        if part.start == start_sector {
            continue;
        }
        // A partition overlapping the gap candidate closes it.
        if part.start < start_sector && end > start_sector {
            return None;
        }
    }

    (start_sector > preceding_end).then(|| start_sector - preceding_end)
}

fn partition_line_re() -> Regex {
    Regex::new(r"start=\s*(\d+),\s*size=\s*(\d+)").expect("static regex")
}

/// Rewrite the dump line of the partition starting at `old_start` so it
/// starts at `new_start` and covers the freed sectors as well.
fn edit_dump_shift_left(dump: &str, old_start: u64, new_start: u64) -> Result<String> {
    let re = partition_line_re();
    let mut found = false;
    let mut out = String::with_capacity(dump.len());

    for line in dump.lines() {
        let edited = match re.captures(line) {
            Some(caps) if caps[1].parse::<u64>().ok() == Some(old_start) => {
                found = true;
                let size: u64 = caps[2].parse()?;
                let grown = size + (old_start - new_start);
                re.replace(line, format!("start={new_start}, size={grown}").as_str())
                    .into_owned()
            }
            _ => line.to_string(),
        };
        out.push_str(&edited);
        out.push('\n');
    }

    anyhow::ensure!(found, "no partition starts at sector {old_start}");
    Ok(out)
}

/// Rewrite the dump line of the partition starting at `start` to cover
/// `new_size` sectors.
fn edit_dump_resize(dump: &str, start: u64, new_size: u64) -> Result<String> {
    let re = partition_line_re();
    let mut found = false;
    let mut out = String::with_capacity(dump.len());

    for line in dump.lines() {
        let edited = match re.captures(line) {
            Some(caps) if caps[1].parse::<u64>().ok() == Some(start) => {
                found = true;
                re.replace(line, format!("start={start}, size={new_size}").as_str())
                    .into_owned()
            }
            _ => line.to_string(),
        };
        out.push_str(&edited);
        out.push('\n');
    }

    anyhow::ensure!(found, "no partition starts at sector {start}");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: &str) -> SfdiskTable {
        let parsed: SfdiskOutput = serde_json::from_str(json).unwrap();
        parsed.partitiontable
    }

    const GPT_JSON: &str = r#"{
        "partitiontable": {
            "label": "gpt",
            "id": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
            "device": "/dev/loop0",
            "unit": "sectors",
            "firstlba": 2048,
            "lastlba": 2097118,
            "sectorsize": 512,
            "partitions": [
                {"node": "/dev/loop0p1", "start": 4096, "size": 1044480, "type": "L"}
            ]
        }
    }"#;

    #[test]
    fn gap_before_first_partition() {
        let t = table(GPT_JSON);
        // 2048..4096 is free: one MiB.
        assert_eq!(free_gap_before(&t, 4096), Some(2048));
    }

    #[test]
    fn no_gap_when_partitions_touch() {
        let json = r#"{
            "partitiontable": {
                "label": "gpt",
                "firstlba": 2048,
                "lastlba": 2097118,
                "sectorsize": 512,
                "partitions": [
                    {"start": 2048, "size": 2048},
                    {"start": 4096, "size": 1024}
                ]
            }
        }"#;
        let t = table(json);
        assert_eq!(free_gap_before(&t, 4096), None);
    }

    #[test]
    fn overlapping_partition_closes_the_gap() {
        let json = r#"{
            "partitiontable": {
                "label": "dos",
                "sectorsize": 512,
                "partitions": [
                    {"start": 2048, "size": 8192},
                    {"start": 8192, "size": 1024}
                ]
            }
        }"#;
        let t = table(json);
        assert_eq!(free_gap_before(&t, 8192), None);
    }

    const DUMP: &str = "label: gpt\n\
label-id: 0FC63DAF-8483-4772-8E79-3D69D8477DE4\n\
device: /dev/loop0\n\
unit: sectors\n\
first-lba: 2048\n\
last-lba: 2097118\n\
\n\
/dev/loop0p1 : start=        4096, size=     1044480, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4\n";

    #[test]
    fn shift_left_moves_start_and_grows() {
        let edited = edit_dump_shift_left(DUMP, 4096, 2048).unwrap();
        assert!(edited.contains("start=2048, size=1046528"));
        assert!(!edited.contains("start=        4096"));
        // Header lines survive untouched.
        assert!(edited.contains("label: gpt"));
        assert!(edited.contains("first-lba: 2048"));
    }

    #[test]
    fn shift_left_requires_a_match() {
        assert!(edit_dump_shift_left(DUMP, 9999, 2048).is_err());
    }

    #[test]
    fn resize_edits_only_the_size() {
        let edited = edit_dump_resize(DUMP, 4096, 522240).unwrap();
        assert!(edited.contains("start=4096, size=522240"));
    }
}
