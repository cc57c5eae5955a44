/*!
Environment query: where raw facet attributes come from.

Providers never touch the operating system directly. They ask an
[`EnvironmentQuery`] for a list of attribute maps, one per observed instance,
and turn those into typed records. On Linux the attributes come from sysfs
and procfs.
*/

use crate::{InventoryError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Raw attributes for one observed instance
pub type AttributeMap = BTreeMap<String, String>;

/// Which facet an environment query is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetSelector {
    Firmware,
    Processor,
}

impl FacetSelector {
    pub fn name(self) -> &'static str {
        match self {
            FacetSelector::Firmware => "firmware",
            FacetSelector::Processor => "processor",
        }
    }
}

/// Source of raw facet attributes
///
/// Queries may block on file or device I/O; callers run them off the async
/// executor.
pub trait EnvironmentQuery: Send + Sync + 'static {
    fn query(&self, selector: FacetSelector) -> Result<Vec<AttributeMap>>;
}

const DMI_ID_DIR: &str = "/sys/class/dmi/id";
const SMBIOS_ENTRY_POINT: &str = "/sys/firmware/dmi/tables/smbios_entry_point";
const CPUINFO: &str = "/proc/cpuinfo";

/// Serial number sources, most specific first
const SERIAL_FILES: &[&str] = &["product_serial", "board_serial", "chassis_serial"];

/// Linux environment query backed by sysfs and procfs
#[derive(Debug, Clone)]
pub struct SysfsQuery {
    dmi_dir: PathBuf,
    smbios_entry_point: PathBuf,
    cpuinfo: PathBuf,
}

impl SysfsQuery {
    /// Query the live system
    pub fn new() -> Self {
        Self::with_roots(DMI_ID_DIR, SMBIOS_ENTRY_POINT, CPUINFO)
    }

    /// Query files under custom locations
    ///
    /// # Arguments
    /// * `dmi_dir` - Directory laid out like `/sys/class/dmi/id`
    /// * `smbios_entry_point` - Raw SMBIOS entry point structure
    /// * `cpuinfo` - File formatted like `/proc/cpuinfo`
    pub fn with_roots<A, B, C>(dmi_dir: A, smbios_entry_point: B, cpuinfo: C) -> Self
    where
        A: AsRef<Path>,
        B: AsRef<Path>,
        C: AsRef<Path>,
    {
        Self {
            dmi_dir: dmi_dir.as_ref().to_path_buf(),
            smbios_entry_point: smbios_entry_point.as_ref().to_path_buf(),
            cpuinfo: cpuinfo.as_ref().to_path_buf(),
        }
    }

    fn read_dmi(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dmi_dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn query_firmware(&self) -> Result<Vec<AttributeMap>> {
        if !self.dmi_dir.is_dir() {
            return Err(InventoryError::acquisition(
                FacetSelector::Firmware.name(),
                format!("DMI directory {} is not available", self.dmi_dir.display()),
            ));
        }

        let mut attrs = AttributeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                attrs.insert(key.to_string(), value);
            }
        };

        put("manufacturer", self.read_dmi("bios_vendor"));
        let version = self.read_dmi("bios_version");
        put("version", version.clone());
        put("smbios_bios_version", version);
        put("release_date", self.read_dmi("bios_date"));

        // bios_release is "major.minor" of the system BIOS itself
        if let Some((major, minor)) = self
            .read_dmi("bios_release")
            .as_deref()
            .and_then(|r| r.split_once('.'))
        {
            put("system_bios_major_version", Some(major.to_string()));
            put("system_bios_minor_version", Some(minor.to_string()));
        }

        put(
            "serial_number",
            SERIAL_FILES.iter().find_map(|name| self.read_dmi(name)),
        );

        if let Ok(raw) = fs::read(&self.smbios_entry_point) {
            if let Some((major, minor)) = parse_smbios_entry_point(&raw) {
                put("smbios_major_version", Some(major.to_string()));
                put("smbios_minor_version", Some(minor.to_string()));
            }
        }

        Ok(vec![attrs])
    }

    fn query_processors(&self) -> Result<Vec<AttributeMap>> {
        let cpuinfo = fs::read_to_string(&self.cpuinfo).map_err(|e| {
            InventoryError::acquisition(
                FacetSelector::Processor.name(),
                format!("cannot read {}: {e}", self.cpuinfo.display()),
            )
        })?;
        Ok(parse_cpuinfo(&cpuinfo))
    }
}

impl Default for SysfsQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentQuery for SysfsQuery {
    fn query(&self, selector: FacetSelector) -> Result<Vec<AttributeMap>> {
        match selector {
            FacetSelector::Firmware => self.query_firmware(),
            FacetSelector::Processor => self.query_processors(),
        }
    }
}

/// SMBIOS version from a raw entry point structure
///
/// 32-bit entry points start with `_SM_` and carry major/minor at offsets
/// 6 and 7; 64-bit ones start with `_SM3_` and carry them at 7 and 8.
pub fn parse_smbios_entry_point(raw: &[u8]) -> Option<(u8, u8)> {
    if raw.starts_with(b"_SM3_") {
        Some((*raw.get(7)?, *raw.get(8)?))
    } else if raw.starts_with(b"_SM_") {
        Some((*raw.get(6)?, *raw.get(7)?))
    } else {
        None
    }
}

/// One attribute map per physical package in `/proc/cpuinfo` text
///
/// Logical processors are grouped by `physical id` (absent on some
/// platforms, in which case everything is socket 0). Sockets come out in
/// ascending order.
pub fn parse_cpuinfo(cpuinfo: &str) -> Vec<AttributeMap> {
    let mut sockets: BTreeMap<u32, AttributeMap> = BTreeMap::new();

    for block in cpuinfo.split("\n\n") {
        let fields: BTreeMap<&str, &str> = block
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        if !fields.contains_key("processor") {
            continue;
        }

        let socket = fields
            .get("physical id")
            .and_then(|id| id.parse::<u32>().ok())
            .unwrap_or(0);

        let entry = sockets.entry(socket).or_insert_with(|| {
            let mut attrs = AttributeMap::new();
            attrs.insert("socket".to_string(), format!("CPU{socket}"));
            for (key, name) in [
                ("vendor_id", "manufacturer"),
                ("model name", "name"),
                ("cpu family", "family"),
                ("model", "model"),
                ("stepping", "stepping"),
                ("microcode", "microcode"),
                ("cpu cores", "cores"),
            ] {
                if let Some(value) = fields.get(key) {
                    attrs.insert(name.to_string(), value.to_string());
                }
            }
            attrs.insert("logical_processors".to_string(), "0".to_string());
            attrs
        });

        let logical = entry
            .get("logical_processors")
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        entry.insert("logical_processors".to_string(), (logical + 1).to_string());
    }

    sockets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CPUINFO_TWO_SOCKETS: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 85
model name\t: Intel(R) Xeon(R) Gold 6130 CPU @ 2.10GHz
stepping\t: 4
microcode\t: 0x2006e05
cpu MHz\t\t: 2100.000
physical id\t: 0
cpu cores\t: 16

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) Gold 6130 CPU @ 2.10GHz
physical id\t: 1
cpu cores\t: 16

processor\t: 2
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) Gold 6130 CPU @ 2.10GHz
physical id\t: 0
cpu cores\t: 16
";

    struct FakeSys {
        _dir: TempDir,
        query: SysfsQuery,
    }

    fn fake_sys(files: &[(&str, &str)], entry_point: Option<&[u8]>) -> FakeSys {
        let dir = TempDir::new().unwrap();
        let dmi = dir.path().join("dmi");
        fs::create_dir_all(&dmi).unwrap();
        for (name, contents) in files {
            fs::write(dmi.join(name), contents).unwrap();
        }
        let entry = dir.path().join("smbios_entry_point");
        if let Some(raw) = entry_point {
            fs::write(&entry, raw).unwrap();
        }
        let cpuinfo = dir.path().join("cpuinfo");
        fs::write(&cpuinfo, CPUINFO_TWO_SOCKETS).unwrap();
        let query = SysfsQuery::with_roots(&dmi, &entry, &cpuinfo);
        FakeSys { _dir: dir, query }
    }

    #[test]
    fn test_firmware_attributes() {
        let sys = fake_sys(
            &[
                ("bios_vendor", "Dell Inc.\n"),
                ("bios_version", "2.17.0\n"),
                ("bios_date", "09/14/2022\n"),
                ("bios_release", "2.17\n"),
                ("board_serial", ".7XJ2KQ2.CN1296\n"),
            ],
            Some(b"_SM3_\x18\x18\x03\x04\x00".as_slice()),
        );

        let maps = sys.query.query(FacetSelector::Firmware).unwrap();
        assert_eq!(maps.len(), 1);
        let attrs = &maps[0];
        assert_eq!(attrs["manufacturer"], "Dell Inc.");
        assert_eq!(attrs["version"], "2.17.0");
        assert_eq!(attrs["smbios_bios_version"], "2.17.0");
        assert_eq!(attrs["release_date"], "09/14/2022");
        assert_eq!(attrs["system_bios_major_version"], "2");
        assert_eq!(attrs["system_bios_minor_version"], "17");
        assert_eq!(attrs["serial_number"], ".7XJ2KQ2.CN1296");
        assert_eq!(attrs["smbios_major_version"], "3");
        assert_eq!(attrs["smbios_minor_version"], "4");
    }

    #[test]
    fn test_unreadable_serial_is_left_out() {
        let sys = fake_sys(&[("bios_vendor", "LENOVO"), ("product_serial", "\n")], None);
        let attrs = &sys.query.query(FacetSelector::Firmware).unwrap()[0];
        assert!(!attrs.contains_key("serial_number"));
        assert!(!attrs.contains_key("smbios_major_version"));
    }

    #[test]
    fn test_missing_dmi_directory() {
        let dir = TempDir::new().unwrap();
        let query = SysfsQuery::with_roots(dir.path().join("nope"), "x", "y");
        let err = query.query(FacetSelector::Firmware).unwrap_err();
        assert!(matches!(err, InventoryError::Acquisition { .. }));
    }

    #[test]
    fn test_smbios_entry_points() {
        assert_eq!(parse_smbios_entry_point(b"_SM_\x1f\x1f\x02\x08"), Some((2, 8)));
        assert_eq!(parse_smbios_entry_point(b"_SM3_\x18\x18\x03\x02"), Some((3, 2)));
        assert_eq!(parse_smbios_entry_point(b"_SM_\x1f"), None);
        assert_eq!(parse_smbios_entry_point(b"garbage"), None);
    }

    #[test]
    fn test_cpuinfo_grouped_by_socket() {
        let sockets = parse_cpuinfo(CPUINFO_TWO_SOCKETS);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0]["socket"], "CPU0");
        assert_eq!(sockets[0]["logical_processors"], "2");
        assert_eq!(sockets[0]["family"], "6");
        assert_eq!(sockets[0]["model"], "85");
        assert_eq!(sockets[0]["microcode"], "0x2006e05");
        assert_eq!(sockets[1]["socket"], "CPU1");
        assert_eq!(sockets[1]["logical_processors"], "1");
        assert!(!sockets[0].contains_key("cpu MHz"));
    }

    #[test]
    fn test_cpuinfo_without_physical_id() {
        let sockets = parse_cpuinfo("processor : 0\nmodel name : ARMv8\n\nprocessor : 1\n");
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0]["logical_processors"], "2");
        assert_eq!(sockets[0]["name"], "ARMv8");
    }

    #[test]
    fn test_processor_query_missing_file() {
        let dir = TempDir::new().unwrap();
        let query = SysfsQuery::with_roots(dir.path(), "x", dir.path().join("cpuinfo"));
        assert!(query.query(FacetSelector::Processor).is_err());
    }
}
