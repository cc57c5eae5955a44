/*!
Change detection between two snapshots of the same facet.
*/

use crate::record::SnapshotRecord;
use std::collections::HashSet;

/// Records of `new` that have no value-equal counterpart in `old`.
///
/// The result keeps the order of `new`. Records that disappeared since `old`
/// are not reported. Lookup goes through a hash set of the old records, so
/// the cost is linear in the size of both inputs.
pub fn difference<R: SnapshotRecord>(new: &[R], old: &[R]) -> Vec<R> {
    if old.is_empty() {
        return new.to_vec();
    }

    let seen: HashSet<&R> = old.iter().collect();
    new.iter()
        .filter(|record| !seen.contains(record))
        .cloned()
        .collect()
}
