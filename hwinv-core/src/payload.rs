/*!
Wire envelope for uploads to the collection service.

Every table accepts the same shape, a `resource` array of row objects:

```json
{"resource": [{"serial_number": "A1", "client_id": "host-42", "bios_id": 7}]}
```
*/

use crate::Result;
use serde::{Deserialize, Serialize};

/// Rows destined for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    resource: Vec<serde_json::Value>,
}

impl Payload {
    /// Build a payload from any serializable rows
    pub fn from_rows<T, I>(rows: I) -> Result<Self>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let resource = rows
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { resource })
    }

    pub fn rows(&self) -> &[serde_json::Value] {
        &self.resource
    }

    pub fn len(&self) -> usize {
        self.resource.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resource.is_empty()
    }

    /// Serialize to the JSON text sent over the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
