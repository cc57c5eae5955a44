/*!
Firmware (BIOS/UEFI) facet.
*/

use super::{parse_attr, query_blocking, text_attr, FacetProvider, FacetTables};
use crate::environment::{AttributeMap, EnvironmentQuery, FacetSelector};
use crate::identity::ClientIdentity;
use crate::payload::Payload;
use crate::record::{RecordId, Snapshot, SnapshotRecord};
use crate::{InventoryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const FIRMWARE_TABLES: FacetTables = FacetTables::new("bios", "x_client_bios");

/// One firmware instance as reported by SMBIOS
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FirmwareRecord {
    pub manufacturer: String,
    pub version: String,
    pub smbios_bios_version: String,
    pub smbios_major_version: Option<u16>,
    pub smbios_minor_version: Option<u16>,
    pub system_bios_major_version: Option<u8>,
    pub system_bios_minor_version: Option<u8>,
    pub release_date: Option<DateTime<Utc>>,
    pub serial_number: String,
}

impl FirmwareRecord {
    /// Build a record from raw environment attributes
    ///
    /// # Errors
    /// * `InventoryError::Acquisition` - no serial number was reported; on
    ///   most systems reading it needs elevated privileges
    pub fn from_attributes(attrs: &AttributeMap) -> Result<Self> {
        let serial_number = text_attr(attrs, "serial_number");
        if serial_number.is_empty() {
            return Err(InventoryError::acquisition(
                FacetSelector::Firmware.name(),
                "firmware serial number is not readable",
            ));
        }

        Ok(Self {
            manufacturer: text_attr(attrs, "manufacturer"),
            version: text_attr(attrs, "version"),
            smbios_bios_version: text_attr(attrs, "smbios_bios_version"),
            smbios_major_version: parse_attr(attrs, "smbios_major_version"),
            smbios_minor_version: parse_attr(attrs, "smbios_minor_version"),
            system_bios_major_version: parse_attr(attrs, "system_bios_major_version"),
            system_bios_minor_version: parse_attr(attrs, "system_bios_minor_version"),
            release_date: attrs
                .get("release_date")
                .and_then(|raw| parse_release_date(raw)),
            serial_number,
        })
    }
}

impl SnapshotRecord for FirmwareRecord {
    fn natural_key(&self) -> &str {
        &self.serial_number
    }
}

/// Firmware release date in any of the formats firmware tables use.
///
/// Unparsable dates are recorded as unknown rather than failing the pull.
pub fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%m/%d/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    // CIM datetime: yyyymmddHHMMSS.mmmmmmsUUU, the offset is ignored
    raw.get(..14)
        .and_then(|prefix| NaiveDateTime::parse_from_str(prefix, "%Y%m%d%H%M%S").ok())
        .map(|dt| dt.and_utc())
}

#[derive(Serialize)]
struct BiosRow<'a> {
    manufacturer: &'a str,
    major_version: Option<u8>,
    minor_version: Option<u8>,
    sm_version: &'a str,
    sm_major_version: Option<u16>,
    sm_minor_versions: Option<u16>,
    release_date: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ClientBiosRow<'a> {
    serial_number: &'a str,
    client_id: &'a ClientIdentity,
    bios_id: RecordId,
}

/// Firmware facet reading SMBIOS data through an environment query
pub struct FirmwareProvider<Q> {
    query: Arc<Q>,
}

impl<Q: EnvironmentQuery> FirmwareProvider<Q> {
    pub fn new(query: Arc<Q>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl<Q: EnvironmentQuery> FacetProvider for FirmwareProvider<Q> {
    type Record = FirmwareRecord;

    fn name(&self) -> &'static str {
        FacetSelector::Firmware.name()
    }

    fn tables(&self) -> FacetTables {
        FIRMWARE_TABLES
    }

    async fn pull(&self) -> Result<Snapshot<FirmwareRecord>> {
        let maps = query_blocking(&self.query, FacetSelector::Firmware).await?;
        let records = maps
            .iter()
            .map(FirmwareRecord::from_attributes)
            .collect::<Result<Vec<_>>>()?;
        Ok(Snapshot::new(records))
    }

    fn build_parent_payload(&self, records: &[FirmwareRecord]) -> Result<Payload> {
        Payload::from_rows(records.iter().map(|r| BiosRow {
            manufacturer: &r.manufacturer,
            major_version: r.system_bios_major_version,
            minor_version: r.system_bios_minor_version,
            sm_version: &r.smbios_bios_version,
            sm_major_version: r.smbios_major_version,
            sm_minor_versions: r.smbios_minor_version,
            release_date: r.release_date,
        }))
    }

    fn build_client_payload(
        &self,
        records: &[FirmwareRecord],
        client: &ClientIdentity,
        parent_id: RecordId,
    ) -> Result<Payload> {
        Payload::from_rows(records.iter().map(|r| ClientBiosRow {
            serial_number: &r.serial_number,
            client_id: client,
            bios_id: parent_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::test_support::CannedQuery;
    use chrono::TimeZone;
    use serde_json::json;

    fn dell() -> Vec<(&'static str, &'static str)> {
        vec![
            ("manufacturer", "Dell Inc."),
            ("version", "DELL   - 1072009"),
            ("smbios_bios_version", "2.17.0"),
            ("smbios_major_version", "3"),
            ("smbios_minor_version", "4"),
            ("system_bios_major_version", "2"),
            ("system_bios_minor_version", "17"),
            ("release_date", "09/14/2022"),
            ("serial_number", "7XJ2KQ2"),
        ]
    }

    fn provider(query: CannedQuery) -> FirmwareProvider<CannedQuery> {
        FirmwareProvider::new(Arc::new(query))
    }

    #[tokio::test]
    async fn test_pull_parses_attributes() {
        let provider = provider(CannedQuery::with(FacetSelector::Firmware, vec![dell()]));
        let snapshot = provider.pull().await.unwrap();

        assert_eq!(snapshot.len(), 1);
        let record = &snapshot.records()[0];
        assert_eq!(record.manufacturer, "Dell Inc.");
        assert_eq!(record.smbios_major_version, Some(3));
        assert_eq!(record.system_bios_minor_version, Some(17));
        assert_eq!(
            record.release_date,
            Some(Utc.with_ymd_and_hms(2022, 9, 14, 0, 0, 0).unwrap())
        );
        assert_eq!(record.natural_key(), "7XJ2KQ2");
    }

    #[tokio::test]
    async fn test_pull_without_serial_is_an_acquisition_error() {
        let mut attrs = dell();
        attrs.retain(|(k, _)| *k != "serial_number");
        let provider = provider(CannedQuery::with(FacetSelector::Firmware, vec![attrs]));

        let err = provider.pull().await.unwrap_err();
        assert!(matches!(err, InventoryError::Acquisition { .. }));
    }

    #[tokio::test]
    async fn test_pull_propagates_environment_failure() {
        let query = CannedQuery::default();
        query.fail(FacetSelector::Firmware);
        let err = provider(query).pull().await.unwrap_err();
        assert!(err.to_string().contains("access denied"));
    }

    #[tokio::test]
    async fn test_garbage_numbers_and_dates_become_unknown() {
        let provider = provider(CannedQuery::with(
            FacetSelector::Firmware,
            vec![vec![
                ("serial_number", "A1"),
                ("smbios_major_version", "three"),
                ("system_bios_major_version", "300"),
                ("release_date", "sometime in 2019"),
            ]],
        ));
        let record = provider.pull().await.unwrap().into_records().remove(0);
        assert_eq!(record.smbios_major_version, None);
        assert_eq!(record.system_bios_major_version, None);
        assert_eq!(record.release_date, None);
        assert_eq!(record.manufacturer, "");
    }

    #[test]
    fn test_release_date_formats() {
        let expected = Utc.with_ymd_and_hms(2020, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_release_date("01/15/2020"), Some(expected));
        assert_eq!(parse_release_date("2020-01-15"), Some(expected));
        assert_eq!(parse_release_date("2020-01-15T00:00:00Z"), Some(expected));
        assert_eq!(parse_release_date("20200115000000.000000+000"), Some(expected));
        assert_eq!(parse_release_date(""), None);
    }

    #[test]
    fn test_parent_payload_shape() {
        let provider = provider(CannedQuery::default());
        let record = FirmwareRecord::from_attributes(
            &dell().into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
        .unwrap();

        let payload = provider.build_parent_payload(&[record]).unwrap();
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"resource": [{
                "manufacturer": "Dell Inc.",
                "major_version": 2,
                "minor_version": 17,
                "sm_version": "2.17.0",
                "sm_major_version": 3,
                "sm_minor_versions": 4,
                "release_date": "2022-09-14T00:00:00Z"
            }]})
        );
    }

    #[test]
    fn test_client_payload_carries_parent_id() {
        let provider = provider(CannedQuery::default());
        let record = FirmwareRecord::from_attributes(
            &[("serial_number", "A1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap();
        let client = ClientIdentity::new("host-42").unwrap();

        let payload = provider
            .build_client_payload(&[record], &client, RecordId(7))
            .unwrap();
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"resource": [{"serial_number": "A1", "client_id": "host-42", "bios_id": 7}]})
        );
    }
}
