use super::shared_booking::{SlotId, StatusSnapshot};

/// Slots that are available now but were not available (or unknown) in the
/// previous snapshot, in ascending id order. Slots that dropped out of the
/// current snapshot are ignored.
pub fn detect(current: &StatusSnapshot, previous: &StatusSnapshot) -> Vec<SlotId> {
    // BTreeMap iteration is already ascending by id
    current
        .slots
        .iter()
        .filter(|(_, status)| status.is_available())
        .filter(|(id, _)| !previous.get(id).is_some_and(|prev| prev.is_available()))
        .map(|(id, _)| id.clone())
        .collect()
}
