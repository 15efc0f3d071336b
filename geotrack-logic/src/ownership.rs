/// Check if this session owns the device being viewed, only the owner may publish its
/// location. Both identifiers must be known and equal.
pub fn is_owner(session_identifier: Option<&str>, registered_identifier: Option<&str>) -> bool {
    matches!(
        (session_identifier, registered_identifier),
        (Some(mine), Some(theirs)) if mine == theirs
    )
}
