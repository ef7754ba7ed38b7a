//! Whether a running container may be moved to a new image.

use crate::config::ANY_SCOPE;

/// Decide if the container running `current_image` under `current_scope`
/// should switch to `desired_image` deployed under `desired_scope`.
///
/// Equal images never upgrade. Otherwise the upgrade is allowed when the
/// container is unscoped, either side uses the wildcard scope, or the scopes
/// match.
pub fn should_upgrade(
    desired_image: &str,
    current_image: &str,
    desired_scope: &str,
    current_scope: &str,
) -> bool {
    if desired_image == current_image {
        return false;
    }
    current_scope.is_empty()
        || current_scope == ANY_SCOPE
        || desired_scope == ANY_SCOPE
        || desired_scope == current_scope
}
